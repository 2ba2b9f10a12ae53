//! The canned response written for every complete request.

/// Value of the `Server` header.
pub const SERVER: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Value of the `Date` header, fixed when the binary is built.
pub const DATE: &str = "Fri, 26 Aug 2011 00:31:53 GMT";

/// The full response, headers and body, as it goes on the wire.
///
/// Shared read-only by every connection; nothing ever copies or mutates it.
pub static RESPONSE: &[u8] = concat!(
    "HTTP/1.1 200 OK\r\n",
    "Server: ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    "\r\n",
    "Date: Fri, 26 Aug 2011 00:31:53 GMT\r\n",
    "Content-Type: text/plain\r\n",
    "Content-Length: 4\r\n",
    "\r\n",
    "OK\r\n",
)
.as_bytes();

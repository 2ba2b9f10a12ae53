use crate::http::parser::{Control, ParseError, Parser, Settings};
use crate::http::response::RESPONSE;
use crate::server::io::{Handle, Registration};

use mio::net::TcpStream;
use mio::{Interest, Token};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{IntoRawFd, RawFd};
use tracing::debug;

/// Scratch space for one read, sized so a typical request arrives in one go.
pub(crate) const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Parser callbacks shared by every connection. Only completion matters.
static SETTINGS: Settings<Stream> = Settings {
    on_message_complete: Some(on_message_complete),
    ..Settings::new()
};

/// One accepted socket, from accept to close.
pub(crate) struct Connection {
    parser: Parser,
    stream: Stream,
}

/// The I/O half of a connection. Parser callbacks receive this so the
/// completion hook can switch interest while the parser is borrowed.
pub(crate) struct Stream {
    socket: TcpStream,

    /// Registered for exactly one interest, matching `state`
    registration: Registration,

    state: State,

    peer: SocketAddr,
}

pub(crate) enum State {
    Reading,
    Writing(WriteCursor),
}

/// How much of the response has gone out.
pub(crate) struct WriteCursor {
    data: &'static [u8],

    /// Never decreases, never exceeds `data.len()`
    sent: usize,
}

/// What the server should do with a connection after driving it.
pub(crate) enum Next {
    /// Wait for the next readiness event
    Wait,

    /// Remove and close
    Close(Reason),
}

#[derive(Debug)]
pub(crate) enum Reason {
    /// The response was written in full
    Flushed,

    /// Zero-byte read
    PeerClosed,

    /// The parser rejected the input
    Malformed(ParseError),

    Io(io::Error),
}

impl Connection {
    /// Register a freshly accepted socket for read readiness.
    pub(crate) fn new(
        mut socket: TcpStream,
        peer: SocketAddr,
        handle: &Handle,
        token: Token,
    ) -> io::Result<Connection> {
        let registration = handle.register(&mut socket, token, Interest::READABLE)?;

        Ok(Connection {
            parser: Parser::request(),
            stream: Stream {
                socket,
                registration,
                state: State::Reading,
                peer,
            },
        })
    }

    /// Drive the connection after a readiness notification.
    pub(crate) fn ready(&mut self) -> Next {
        match self.stream.state {
            State::Reading => self.read(),
            State::Writing(_) => self.stream.write(),
        }
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.stream.peer
    }

    pub(crate) fn is_reading(&self) -> bool {
        matches!(self.stream.state, State::Reading)
    }

    pub(crate) fn interest(&self) -> Interest {
        self.stream.registration.interest()
    }

    /// Deregister, then close the descriptor. Both are attempted; the first
    /// failure is returned.
    pub(crate) fn close(self) -> io::Result<()> {
        let Stream {
            mut socket,
            registration,
            ..
        } = self.stream;

        let deregistered = registration.deregister(&mut socket);
        let closed = close_fd(socket.into_raw_fd());

        deregistered.and(closed)
    }

    /// Read until the socket is drained, the peer goes away, or a full
    /// request has been parsed.
    fn read(&mut self) -> Next {
        debug_assert_eq!(self.interest(), Interest::READABLE);
        let mut buf = [0; READ_BUFFER_SIZE];

        loop {
            let n = match self.stream.socket.read(&mut buf) {
                Ok(0) => return Next::Close(Reason::PeerClosed),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Next::Wait,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Next::Close(Reason::Io(e)),
            };

            self.parser.execute(&SETTINGS, &mut self.stream, &buf[..n]);
            if let Some(err) = self.parser.error() {
                return Next::Close(Reason::Malformed(err));
            }

            // One request per connection; the hook paused the parser and the
            // rest of the input is ignored
            if !self.is_reading() {
                return Next::Wait;
            }
        }
    }
}

impl Stream {
    fn write(&mut self) -> Next {
        let State::Writing(cursor) = &mut self.state else {
            return Next::Wait;
        };
        debug_assert_eq!(self.registration.interest(), Interest::WRITABLE);

        loop {
            match self.socket.write(cursor.remaining()) {
                Ok(0) => return Next::Close(Reason::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    cursor.advance(n);
                    if cursor.is_complete() {
                        return Next::Close(Reason::Flushed);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Next::Wait,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Next::Close(Reason::Io(e)),
            }
        }
    }
}

/// Switch from reading to writing. Runs inside `Parser::execute` and pauses
/// it, so no input after the first request is parsed.
fn on_message_complete(stream: &mut Stream) -> Control {
    if let Err(e) = stream
        .registration
        .reregister(&mut stream.socket, Interest::WRITABLE)
    {
        debug!(
            token = stream.registration.token().0,
            peer = %stream.peer,
            error = %e,
            "failed to switch to write interest"
        );
        return Control::Abort;
    }

    stream.state = State::Writing(WriteCursor::new(RESPONSE));
    Control::Pause
}

fn close_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` comes from `into_raw_fd`, nothing else owns it.
    if unsafe { libc::close(fd) } == -1 {
        let err = io::Error::last_os_error();

        // The descriptor is released even when close is interrupted
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    Ok(())
}

impl WriteCursor {
    pub(crate) fn new(data: &'static [u8]) -> WriteCursor {
        WriteCursor { data, sent: 0 }
    }

    pub(crate) fn remaining(&self) -> &'static [u8] {
        let data: &'static [u8] = self.data;
        &data[self.sent..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.size() - self.sent);
        self.sent = (self.sent + n).min(self.size());
    }

    #[cfg(test)]
    pub(crate) fn sent(&self) -> usize {
        self.sent
    }

    pub(crate) fn size(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.sent == self.size()
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Flushed => f.write_str("response flushed"),
            Reason::PeerClosed => f.write_str("peer closed"),
            Reason::Malformed(err) => write!(f, "malformed request: {}", err),
            Reason::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

use crate::server::io::{Handle, Registration};

use mio::net::TcpStream;
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;

pub(crate) struct Listener {
    /// Mio listener
    mio: mio::net::TcpListener,

    /// Socket registered with the I/O driver
    registration: Registration,
}

impl Listener {
    /// Bind a non-blocking listener (SO_REUSEADDR, OS default backlog) and
    /// register it for accept readiness.
    pub(crate) fn bind(addr: SocketAddr, handle: &Handle, token: Token) -> io::Result<Listener> {
        let mut mio = mio::net::TcpListener::bind(addr)?;
        let registration = handle.register(&mut mio, token, Interest::READABLE)?;
        Ok(Listener { mio, registration })
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.mio.local_addr()
    }

    pub(crate) fn token(&self) -> Token {
        self.registration.token()
    }

    /// Accept one pending connection.
    ///
    /// `Ok(None)` once the backlog is empty. The returned stream is already
    /// non-blocking.
    pub(crate) fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.mio.accept() {
                Ok(pair) => return Ok(Some(pair)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

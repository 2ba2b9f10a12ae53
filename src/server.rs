pub(crate) mod io;

use crate::config::{Config, FatalPolicy};
use crate::net::{Connection, Listener, Next, Reason};

use mio::Token;
use slab::Slab;
use std::io as stdio;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Token of the listening socket. Connection tokens are slab keys.
const LISTENER: Token = Token(usize::MAX);

const INITIAL_CONNECTIONS_CAPACITY: usize = 256;

/// Longest wait before accepting again after a failed accept.
const ACCEPT_RETRY: Duration = Duration::from_millis(10);

/// Single-threaded server answering every request with the canned response.
pub struct Server {
    driver: io::Driver,
    listener: Listener,
    connections: Connections,
}

/// Lifetime counters.
///
/// `accepted == responded + dropped + live connections` at every turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Connections accepted from the listener
    pub accepted: u64,

    /// Connections closed after a full response
    pub responded: u64,

    /// Connections closed for any other reason
    pub dropped: u64,
}

/// Live connections, keyed by token.
struct Connections {
    handle: io::Handle,
    slab: Slab<Connection>,
    fatal: FatalPolicy,
    stats: Stats,

    /// An accept failed with connections possibly still queued. The listener
    /// is edge-triggered and will not report them again.
    accept_pending: bool,
}

impl Server {
    /// Create the poller and start listening. Any failure here is returned
    /// as is.
    pub fn bind(config: Config) -> stdio::Result<Server> {
        let (driver, handle) = io::driver(config.events_capacity)?;
        let listener = Listener::bind(config.addr, &handle, LISTENER)?;

        info!("Listening on http://{}/", listener.local_addr()?);

        Ok(Server {
            driver,
            listener,
            connections: Connections {
                handle,
                slab: Slab::with_capacity(INITIAL_CONNECTIONS_CAPACITY),
                fatal: config.fatal,
                stats: Stats::default(),
                accept_pending: false,
            },
        })
    }

    pub fn local_addr(&self) -> stdio::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until a fatal error.
    pub fn run(&mut self) -> stdio::Result<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// Wait once for readiness, at most `timeout`, and handle every event.
    ///
    /// After a failed accept the wait is capped at `ACCEPT_RETRY` and the
    /// backlog is tried again at the end of every turn until it drains.
    pub fn turn(&mut self, timeout: Option<Duration>) -> stdio::Result<()> {
        let timeout = if self.connections.accept_pending {
            Some(timeout.map_or(ACCEPT_RETRY, |t| t.min(ACCEPT_RETRY)))
        } else {
            timeout
        };

        self.driver.park(timeout)?;
        let mut accepted = false;

        for event in self.driver.events() {
            let token = event.token();

            if token == self.listener.token() {
                self.connections.accept(&self.listener)?;
                accepted = true;
            } else {
                self.connections.ready(token)?;
            }
        }

        if self.connections.accept_pending && !accepted {
            self.connections.accept(&self.listener)?;
        }

        Ok(())
    }

    pub fn stats(&self) -> Stats {
        self.connections.stats
    }

    pub fn live_connections(&self) -> usize {
        self.connections.slab.len()
    }
}

impl Connections {
    /// Accept everything pending; readiness is edge-triggered, so the backlog
    /// must be emptied before waiting again.
    fn accept(&mut self, listener: &Listener) -> stdio::Result<()> {
        loop {
            let (socket, peer) = match listener.accept() {
                Ok(Some(pair)) => pair,
                Ok(None) => {
                    self.accept_pending = false;
                    return Ok(());
                }
                Err(e) => {
                    self.accept_pending = true;
                    return self.fatal("accept", e);
                }
            };

            self.stats.accepted += 1;

            let entry = self.slab.vacant_entry();
            let token = Token(entry.key());

            match Connection::new(socket, peer, &self.handle, token) {
                Ok(conn) => {
                    debug!(token = token.0, %peer, "accepted");
                    entry.insert(conn);
                }
                Err(e) => {
                    debug!(%peer, error = %e, "failed to register connection");
                    self.stats.dropped += 1;
                }
            }
        }
    }

    fn ready(&mut self, token: Token) -> stdio::Result<()> {
        // Stale events for a connection closed earlier in this turn
        let Some(conn) = self.slab.get_mut(token.0) else {
            return Ok(());
        };

        match conn.ready() {
            Next::Wait => Ok(()),
            Next::Close(reason) => self.destroy(token, reason),
        }
    }

    /// The only place a connection leaves the slab.
    fn destroy(&mut self, token: Token, reason: Reason) -> stdio::Result<()> {
        let conn = self.slab.remove(token.0);
        let peer = conn.peer();

        match &reason {
            Reason::Flushed => {
                trace!(token = token.0, %peer, "{}", reason);
                self.stats.responded += 1;
            }
            Reason::PeerClosed => {
                trace!(token = token.0, %peer, "{}", reason);
                self.stats.dropped += 1;
            }
            Reason::Malformed(_) | Reason::Io(_) => {
                debug!(token = token.0, %peer, "dropping connection: {}", reason);
                self.stats.dropped += 1;
            }
        }

        match conn.close() {
            Ok(()) => Ok(()),
            Err(e) => self.fatal("close", e),
        }
    }

    fn fatal(&self, op: &'static str, err: stdio::Error) -> stdio::Result<()> {
        match self.fatal {
            FatalPolicy::Abort => {
                error!(op, error = %err, "fatal OS error");
                Err(err)
            }
            FatalPolicy::LogAndContinue => {
                warn!(op, error = %err, "OS error, continuing");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RESPONSE;

    use mio::Interest;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn server() -> Server {
        let addr = "127.0.0.1:0".parse().unwrap();
        Server::bind(Config::new(addr)).unwrap()
    }

    fn turn_until(server: &mut Server, done: impl Fn(&Server) -> bool) {
        for _ in 0..200 {
            if done(server) {
                return;
            }
            server.turn(Some(Duration::from_millis(10))).unwrap();
        }
        panic!("condition not reached, stats: {:?}", server.stats());
    }

    fn only_connection(server: &Server) -> &Connection {
        assert_eq!(server.connections.slab.len(), 1);
        server.connections.slab.iter().next().unwrap().1
    }

    #[test]
    fn registration_follows_the_phase() {
        let mut server = server();
        let mut client = TcpStream::connect(server.local_addr().unwrap()).unwrap();

        turn_until(&mut server, |s| s.stats().accepted == 1);
        let conn = only_connection(&server);
        assert!(conn.is_reading());
        assert_eq!(conn.interest(), Interest::READABLE);

        client.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        server.turn(Some(Duration::from_millis(50))).unwrap();
        let conn = only_connection(&server);
        assert!(conn.is_reading());
        assert_eq!(conn.interest(), Interest::READABLE);

        client.write_all(b"\r\n").unwrap();
        turn_until(&mut server, |s| s.live_connections() == 0);
        assert_eq!(
            server.stats(),
            Stats {
                accepted: 1,
                responded: 1,
                dropped: 0
            }
        );

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, RESPONSE);
    }

    #[test]
    fn stale_tokens_are_ignored() {
        let mut server = server();
        server.connections.ready(Token(42)).unwrap();
        assert_eq!(server.stats(), Stats::default());
    }

    #[test]
    fn every_accepted_connection_is_destroyed_once() {
        let mut server = server();

        for i in 1..=3 {
            let client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
            drop(client);
            turn_until(&mut server, |s| s.stats().dropped == i);
            assert_eq!(server.live_connections(), 0);
        }

        // Nothing left to deliver; further turns change nothing
        server.turn(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(
            server.stats(),
            Stats {
                accepted: 3,
                responded: 0,
                dropped: 3
            }
        );
    }

    #[test]
    fn zero_events_capacity_still_serves() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut config = Config::new(addr);
        config.events_capacity = 0;

        let mut server = Server::bind(config).unwrap();
        assert_eq!(server.driver.events_capacity(), 1);

        let mut client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        turn_until(&mut server, |s| s.stats().responded == 1);

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, RESPONSE);
    }

    #[test]
    fn pending_accept_caps_the_wait() {
        let mut server = server();
        server.connections.accept_pending = true;

        // Nothing is queued: the wait ends early and the retry drains nothing
        let started = std::time::Instant::now();
        server.turn(Some(Duration::from_secs(5))).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!server.connections.accept_pending);
    }

    #[test]
    fn fatal_policy_decides_whether_errors_escape() {
        let mut server = server();
        let err = || stdio::Error::from_raw_os_error(libc::EMFILE);

        assert!(server.connections.fatal("accept", err()).is_err());

        server.connections.fatal = FatalPolicy::LogAndContinue;
        assert!(server.connections.fatal("accept", err()).is_ok());
    }
}

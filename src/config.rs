use std::net::{Ipv4Addr, SocketAddr};

/// Port the server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8000;

const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// What the event loop does when an OS call outside any single connection
/// fails at runtime: an accept error other than would-block/interrupted, or
/// a failed deregister/close while tearing a connection down.
///
/// Failures while setting up (creating the poller, binding, registering the
/// listener) always end `Server::bind` with an error, and a failed wait on
/// the poller always ends the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Return the error from the loop, ending the process.
    #[default]
    Abort,

    /// Log a warning and keep serving. Suited to transient conditions such
    /// as running out of file descriptors.
    LogAndContinue,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on
    pub addr: SocketAddr,

    /// Handling of runtime OS failures
    pub fatal: FatalPolicy,

    /// Readiness events fetched per wait; zero is treated as one
    pub events_capacity: usize,
}

impl Config {
    pub fn new(addr: SocketAddr) -> Config {
        Config {
            addr,
            ..Config::default()
        }
    }

    pub fn fatal(mut self, policy: FatalPolicy) -> Config {
        self.fatal = policy;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Config {
        self.events_capacity = capacity;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            fatal: FatalPolicy::default(),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

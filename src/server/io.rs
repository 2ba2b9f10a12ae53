use mio::event::Source;
use mio::{Interest, Token};
use std::io;
use std::rc::Rc;
use std::time::Duration;

/// Used to register sockets w/ epoll
#[derive(Clone)]
pub(crate) struct Handle {
    mio: Rc<mio::Registry>,
}

/// Used by the server to wait for I/O events
pub(crate) struct Driver {
    /// The system event queue
    mio: mio::Poll,

    /// Used to receive events from `Poll`
    events: mio::Events,
}

/// A source registered with the driver under one token for one interest.
pub(crate) struct Registration {
    handle: Handle,

    /// Slab key of the owner, doubles as the mio token
    token: Token,

    /// The single interest currently registered
    interest: Interest,
}

/// `events_capacity` is raised to one; an empty buffer would make every wait
/// return nothing.
pub(crate) fn driver(events_capacity: usize) -> io::Result<(Driver, Handle)> {
    let mio = mio::Poll::new()?;

    let handle = Handle {
        mio: Rc::new(mio.registry().try_clone()?),
    };

    let driver = Driver {
        mio,
        events: mio::Events::with_capacity(events_capacity.max(1)),
    };

    Ok((driver, handle))
}

impl Handle {
    pub(crate) fn register(
        &self,
        io: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<Registration> {
        self.mio.register(io, token, interest)?;

        Ok(Registration {
            handle: self.clone(),
            token,
            interest,
        })
    }
}

impl Driver {
    /// Block until at least one registered source is ready or `timeout`
    /// elapses. An interrupted wait returns with no events.
    pub(crate) fn park(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.mio.poll(&mut self.events, timeout) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                self.events.clear();
                Ok(())
            }
            res => res,
        }
    }

    pub(crate) fn events(&self) -> &mio::Events {
        &self.events
    }
}

#[cfg(test)]
impl Driver {
    pub(crate) fn events_capacity(&self) -> usize {
        self.events.capacity()
    }
}

impl Registration {
    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn interest(&self) -> Interest {
        self.interest
    }

    /// Swap the registered interest. The kernel entry is modified in place,
    /// so the source is never registered for both interests or for none.
    pub(crate) fn reregister(&mut self, io: &mut impl Source, interest: Interest) -> io::Result<()> {
        self.handle.mio.reregister(io, self.token, interest)?;
        self.interest = interest;
        Ok(())
    }

    pub(crate) fn deregister(self, io: &mut impl Source) -> io::Result<()> {
        self.handle.mio.deregister(io)
    }
}

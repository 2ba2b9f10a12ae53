mod connection;
pub(crate) use connection::{Connection, Next, Reason};

mod listener;
pub(crate) use listener::Listener;

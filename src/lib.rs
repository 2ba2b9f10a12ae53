//! A single-threaded, readiness-driven HTTP/1.x server that answers every
//! complete request with one fixed response and then closes the connection.

pub mod config;
pub mod http;
mod net;
mod server;

pub use config::{Config, FatalPolicy};
pub use server::{Server, Stats};

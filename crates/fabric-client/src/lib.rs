//! The client role and its per-worker `Connection` handles (§4.5, §4.6).

mod client;
mod connection;
mod error;

pub use client::Client;
pub use connection::Connection;
pub use error::ClientError;

//! High-level client: address parsing, connect/handshake, the write path,
//! keepalive and teardown behind one [`Client`] type. The guarantees
//! documented on [`Client`] are the public contract of the crate.
pub mod client;
pub mod endpoint;

pub use client::{Client, ClientError, DisconnectHandle};
pub use endpoint::Endpoint;

//! WebSocket layer: handshake, frame codec, correlation, subscriptions.
//!
//! A [`Connection`] multiplexes request/response exchanges and long-lived
//! event subscriptions over one authenticated websocket.

pub mod connection;
pub mod correlator;
pub mod handshake;
pub mod messages;
pub mod subscription;

#[cfg(test)]
#[allow(clippy::panic)]
pub(crate) mod test_support;

pub use connection::{Connection, ConnectionOptions};
pub use messages::ServerMessage;

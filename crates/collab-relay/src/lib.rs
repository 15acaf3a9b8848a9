//! collab-relay library: the relay's WebSocket plumbing.
//!
//! A thin layer over `collab_core::room::RoomHub`, exposed so integration
//! tests can drive the server directly.

pub mod connection;
pub mod server;

pub use connection::{ClientConnection, ConnectionEvent};
pub use server::RelayServer;

//! IPC between CLI/editor integrations and the daemon
//!
//! Unix domain socket, one JSON request per connection.

pub mod client;
pub mod protocol;
pub mod server;

pub use server::SocketServer;

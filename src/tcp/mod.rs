//! TCP transport: per-socket connections, the acceptor and a client.

pub mod client;
pub mod connection;
pub mod server;

pub use client::StompTcpClient;
pub use connection::{Connection, FrameHandler, FrameSink};
pub use server::StompTcpServer;

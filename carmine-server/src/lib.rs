//! Server runtime: listener, per-connection RESP sessions, shutdown.

pub mod handler;
pub mod server;

pub use server::Server;

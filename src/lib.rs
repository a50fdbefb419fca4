pub mod config;
pub mod error;
pub mod multiplexer;
pub mod pty;
pub mod relay;
pub mod server;
pub mod version;

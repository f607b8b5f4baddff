// src/lib.rs
pub mod conn;
pub mod engine;
pub mod error;
pub mod http;
pub mod logging;
pub mod poller;
pub mod pool;
pub mod sys;
pub mod table;
pub mod transport;
pub mod ws;

// Re-exports for users
pub use conn::Conn;
pub use engine::{Config, Engine};
pub use error::{SquallError, SquallResult};
pub use http::server::HttpServer;
pub use logging::{init_logging, init_logging_with_level};
pub use transport::Transport;

use crate::http::error::HttpError;
use crate::ws::WsError;
use std::io;

/// Central error type for the squall engine.
#[derive(Debug)]
pub enum SquallError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Operation on a connection that has already been closed.
    Closed,
    /// A per-connection deadline expired.
    TimedOut,
    /// The connection's write queue exceeded `max_write_buffer_size`.
    WriteBufferOverflow,
    /// Error during HTTP message parsing.
    Http(HttpError),
    /// WebSocket framing or handshake error.
    Ws(WsError),
    /// The engine is shutting down.
    Shutdown,
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for SquallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SquallError::Io(e) => write!(f, "I/O error: {}", e),
            SquallError::Closed => write!(f, "connection closed"),
            SquallError::TimedOut => write!(f, "deadline exceeded"),
            SquallError::WriteBufferOverflow => write!(f, "write buffer overflow"),
            SquallError::Http(e) => write!(f, "HTTP error: {}", e),
            SquallError::Ws(e) => write!(f, "WebSocket error: {}", e),
            SquallError::Shutdown => write!(f, "engine shut down"),
            SquallError::Other(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl std::error::Error for SquallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SquallError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SquallError {
    fn from(e: io::Error) -> Self {
        SquallError::Io(e)
    }
}

impl From<HttpError> for SquallError {
    fn from(e: HttpError) -> Self {
        SquallError::Http(e)
    }
}

impl From<WsError> for SquallError {
    fn from(e: WsError) -> Self {
        SquallError::Ws(e)
    }
}

pub type SquallResult<T> = Result<T, SquallError>;

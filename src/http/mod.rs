//! HTTP/1.x: incremental parser, processor plumbing, response writer, and
//! the server glue.

pub mod error;
pub mod message;
pub mod parser;
pub mod processor;
pub mod response;
pub mod server;

pub use error::HttpError;
pub use message::{BodyReader, HeaderMap, Request};
pub use parser::{Parser, Upgrader};
pub use processor::{Handler, Processor, ServerProcessor};
pub use response::{status_text, Response};
pub use server::HttpServer;

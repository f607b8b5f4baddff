//! Glue from engine hooks to the HTTP machinery: one parser + processor
//! per connection, stored in the connection's session slot.

use crate::conn::Conn;
use crate::engine::{Config, Engine};
use crate::error::SquallResult;
use crate::http::message::Request;
use crate::http::parser::Parser;
use crate::http::processor::{Executor, H2Handoff, Handler, ServerProcessor};
use crate::http::response::Response;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Nonblocking HTTP/1.x server over the reactor.
pub struct HttpServer {
    engine: Engine,
    handler: Handler,
    executor: Option<Executor>,
    h2_handoff: Option<H2Handoff>,
}

impl HttpServer {
    pub fn new<F>(config: Config, handler: F) -> Self
    where
        F: Fn(&mut Response, &mut Request) + Send + Sync + 'static,
    {
        Self {
            engine: Engine::new(config),
            handler: Arc::new(handler),
            executor: None,
            h2_handoff: None,
        }
    }

    /// Run handlers on an external worker pool instead of inline on the
    /// poller thread. Response order on a connection is preserved either
    /// way.
    pub fn with_executor<F>(mut self, executor: F) -> Self
    where
        F: Fn(Box<dyn FnOnce() + Send>) + Send + Sync + 'static,
    {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Receive connections that open with the HTTP/2 preface.
    pub fn with_http2_handoff<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Conn>, &[u8]) + Send + Sync + 'static,
    {
        self.h2_handoff = Some(Arc::new(f));
        self
    }

    pub fn start(&mut self) -> SquallResult<()> {
        let handler = self.handler.clone();
        let executor = self.executor.clone();
        let h2_handoff = self.h2_handoff.clone();
        let keepalive = self.engine.inner().keepalive;

        self.engine.on_open(move |conn| {
            let processor = ServerProcessor::new(
                conn.clone(),
                handler.clone(),
                executor.clone(),
                h2_handoff.clone(),
                keepalive,
            );
            let parser = Parser::new(Box::new(processor));
            conn.set_session(Arc::new(Mutex::new(parser)));
        });

        self.engine.on_data(|conn, data| {
            let Some(session) = conn.session() else {
                return;
            };
            let Ok(parser) = session.downcast::<Mutex<Parser>>() else {
                return;
            };
            let mut guard = parser.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = guard.read(data) {
                warn!("parse error on fd {}: {}", conn.fd(), e);
                drop(guard);
                conn.close_with_err(e);
            }
        });

        self.engine.start()
    }

    pub fn stop(&mut self) {
        self.engine.stop();
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.engine.local_addrs()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}

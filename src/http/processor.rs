//! Parser callback plumbing.
//!
//! The [`Processor`] trait receives every event the parser emits. The
//! server implementation assembles a [`Request`], runs the handler (inline
//! on the poller thread, or through the optional executor), and routes the
//! finished [`Response`] through the pipelined sequence queue so wire
//! order always matches request-arrival order.

use crate::conn::Conn;
use crate::error::SquallResult;
use crate::http::error::HttpError;
use crate::http::message::Request;
use crate::http::parser::{parse_http_version, Upgrader};
use crate::http::response::{Response, ResponseQueue};
use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};

/// User request handler.
pub type Handler = Arc<dyn Fn(&mut Response, &mut Request) + Send + Sync>;

/// Optional off-thread runner for handlers.
pub type Executor = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// Sink for connections that arrive with the HTTP/2 preface.
pub type H2Handoff = Arc<dyn Fn(&Arc<Conn>, &[u8]) + Send + Sync>;

/// Receiver of parser events.
pub trait Processor: Send {
    fn conn(&self) -> Option<Arc<Conn>> {
        None
    }
    fn on_method(&mut self, _method: &str) {}
    fn on_url(&mut self, _uri: &str) -> Result<(), HttpError> {
        Ok(())
    }
    fn on_proto(&mut self, _proto: &str) -> Result<(), HttpError> {
        Ok(())
    }
    fn on_status(&mut self, _code: u16, _status: &str) {}
    fn on_header(&mut self, _key: String, _value: String) {}
    fn on_content_length(&mut self, _n: usize) {}
    /// Body bytes. A borrowed chunk must be copied before returning; an
    /// owned chunk carries its pooled buffer along.
    fn on_body(&mut self, _data: Cow<'_, [u8]>) {}
    fn on_trailer_header(&mut self, _key: String, _value: String) {}
    /// The message is complete. Installing an upgrader switches the parser
    /// into pass-through mode for all subsequent bytes.
    fn on_complete(&mut self, upgrader: &mut Option<Box<dyn Upgrader>>);
    /// Drop any buffered per-connection state.
    fn clear(&mut self) {}
}

/// Discards everything. Useful as a placeholder and in tests.
pub struct EmptyProcessor;

impl Processor for EmptyProcessor {
    fn on_complete(&mut self, _upgrader: &mut Option<Box<dyn Upgrader>>) {}
}

fn validate_request_uri(uri: &str) -> Result<(), HttpError> {
    if uri == "*" || uri.starts_with('/') || uri.contains("://") {
        Ok(())
    } else {
        Err(HttpError::InvalidRequestURI)
    }
}

struct Pipeline {
    queue: ResponseQueue,
    sequence: u64,
    responded_seq: u64,
}

pub(crate) struct ProcShared {
    conn: Arc<Conn>,
    handler: Handler,
    executor: Option<Executor>,
    h2_handoff: Option<H2Handoff>,
    keepalive: Duration,
    pipeline: Mutex<Pipeline>,
}

impl ProcShared {
    /// Run the handler with panic isolation. A panicking handler that
    /// produced no status yields a synthesized 500.
    fn execute(&self, res: &mut Response, req: &mut Request) {
        let result = catch_unwind(AssertUnwindSafe(|| (self.handler)(res, req)));
        if let Err(panic) = result {
            error!("handler panicked: {:?}", panic);
            if res.status_code() == 0 {
                res.reset_to_500();
            }
        }
    }

    /// Push one finished response and drain every head whose sequence is
    /// next in line. Holding the pipeline mutex across the writes keeps
    /// wire order identical to request order.
    fn write_response(&self, res: Response, req: Request) {
        let mut p = self.pipeline.lock().unwrap_or_else(|e| e.into_inner());
        p.queue.push(res, req);
        while p.queue.peek_seq() == Some(p.responded_seq + 1) {
            let (mut res, req) = match p.queue.pop() {
                Some(entry) => entry,
                None => break,
            };
            p.responded_seq += 1;
            let bytes = res.encode();
            if self.conn.write(&bytes).is_err() {
                p.queue.clear();
                return;
            }
            if req.close {
                p.queue.clear();
                drop(p);
                self.conn.close();
                return;
            }
            self.conn.set_read_deadline(Some(self.keepalive));
        }
    }
}

/// Server-side processor: one per connection.
pub struct ServerProcessor {
    shared: Arc<ProcShared>,
    request: Option<Request>,
    is_upgrade: bool,
}

impl ServerProcessor {
    pub fn new(
        conn: Arc<Conn>,
        handler: Handler,
        executor: Option<Executor>,
        h2_handoff: Option<H2Handoff>,
        keepalive: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(ProcShared {
                conn,
                handler,
                executor,
                h2_handoff,
                keepalive,
                pipeline: Mutex::new(Pipeline {
                    queue: ResponseQueue::new(),
                    sequence: 0,
                    responded_seq: 0,
                }),
            }),
            request: None,
            is_upgrade: false,
        }
    }

    fn request_mut(&mut self) -> &mut Request {
        self.request.get_or_insert_with(Request::new)
    }
}

impl Processor for ServerProcessor {
    fn conn(&self) -> Option<Arc<Conn>> {
        Some(self.shared.conn.clone())
    }

    fn on_method(&mut self, method: &str) {
        self.request_mut().method = method.to_string();
    }

    fn on_url(&mut self, uri: &str) -> Result<(), HttpError> {
        validate_request_uri(uri)?;
        self.request_mut().uri = uri.to_string();
        Ok(())
    }

    fn on_proto(&mut self, proto: &str) -> Result<(), HttpError> {
        let (major, minor) = parse_http_version(proto)?;
        let req = self.request_mut();
        req.proto = proto.to_string();
        req.proto_major = major;
        req.proto_minor = minor;
        Ok(())
    }

    fn on_header(&mut self, key: String, value: String) {
        if key.eq_ignore_ascii_case("connection")
            && value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        {
            self.is_upgrade = true;
        } else if key.eq_ignore_ascii_case("transfer-encoding")
            && value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
        {
            self.request_mut().chunked = true;
        }
        self.request_mut().headers.add(key, value);
    }

    fn on_content_length(&mut self, n: usize) {
        self.request_mut().content_length = Some(n);
    }

    fn on_body(&mut self, data: Cow<'_, [u8]>) {
        let req = self.request_mut();
        match data {
            Cow::Borrowed(chunk) => req.body.append(chunk),
            Cow::Owned(buf) => req.body.adopt(buf),
        }
    }

    fn on_trailer_header(&mut self, key: String, value: String) {
        self.request_mut().trailers.add(key, value);
    }

    fn on_complete(&mut self, upgrader: &mut Option<Box<dyn Upgrader>>) {
        let mut req = self.request.take().unwrap_or_default();
        req.remote_addr = Some(self.shared.conn.peer_addr());

        // Persistent-connection rules: HTTP/1.0 closes unless keep-alive
        // is explicit, anything older always closes.
        if req.proto_major < 1 {
            req.close = true;
        } else if req.proto_major == 1 && req.proto_minor == 0 {
            let keep = req.headers.contains_token("Connection", "keep-alive");
            let close = req.headers.contains_token("Connection", "close");
            req.close = close || !keep;
        } else if req.headers.contains_token("Connection", "close") {
            req.close = true;
        }

        // HTTP/2 preface: hand the connection off, the HTTP/1.x parser is
        // done with it.
        if req.method == "PRI" && req.headers.is_empty() && req.uri == "*" && req.proto == "HTTP/2.0"
        {
            self.is_upgrade = false;
            *upgrader = Some(Box::new(Http2Preface {
                conn: self.shared.conn.clone(),
                handoff: self.shared.h2_handoff.clone(),
            }));
            return;
        }

        let sequence = {
            let mut p = self
                .shared
                .pipeline
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            p.sequence += 1;
            p.sequence
        };
        let mut res = Response::new(Some(self.shared.conn.clone()), &req, sequence);
        let shared = self.shared.clone();

        match (&self.shared.executor, self.is_upgrade) {
            (Some(executor), false) => {
                let mut req = req;
                executor(Box::new(move || {
                    shared.execute(&mut res, &mut req);
                    shared.write_response(res, req);
                }));
            }
            _ => {
                // Upgrade requests always run inline so the upgrader lands
                // in the parser before the next bytes arrive.
                let mut req = req;
                shared.execute(&mut res, &mut req);
                let up = res.take_upgrader();
                shared.write_response(res, req);
                if up.is_some() {
                    *upgrader = up;
                }
            }
        }
        self.is_upgrade = false;
    }

    fn clear(&mut self) {
        let mut p = self
            .shared
            .pipeline
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        p.queue.clear();
    }
}

/// Pass-through installed when a connection opens with the RFC 7540
/// client preface. The engine does not speak HTTP/2; bytes go to the
/// configured hand-off, or are dropped with a note when none exists.
struct Http2Preface {
    conn: Arc<Conn>,
    handoff: Option<H2Handoff>,
}

impl Upgrader for Http2Preface {
    fn read(&mut self, data: &[u8]) -> SquallResult<()> {
        match &self.handoff {
            Some(sink) => sink(&self.conn, data),
            None => {
                debug!(
                    "h2 preface on fd {} with no handoff installed, dropping {} bytes",
                    self.conn.fd(),
                    data.len()
                );
            }
        }
        Ok(())
    }
}

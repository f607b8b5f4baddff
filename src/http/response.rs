//! Server-side response: accumulation, serialization, and the pipelined
//! sequence queue.

use crate::conn::Conn;
use crate::error::{SquallError, SquallResult};
use crate::http::message::{HeaderMap, Request};
use crate::http::parser::Upgrader;
use std::collections::BinaryHeap;
use std::sync::Arc;

const BODY_FRAGMENT_SIZE: usize = 4096;

pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

/// An HTTP response under construction. Writes accumulate in memory and
/// are serialized in one pass when the pipeline flushes this response.
pub struct Response {
    conn: Option<Arc<Conn>>,
    sequence: u64,
    proto: String,
    proto_major: u8,
    proto_minor: u8,
    status_code: u16,
    status: &'static str,
    headers: HeaderMap,
    body_list: Vec<Vec<u8>>,
    body_size: usize,
    upgrader: Option<Box<dyn Upgrader>>,
}

impl Response {
    pub fn new(conn: Option<Arc<Conn>>, req: &Request, sequence: u64) -> Self {
        let mut headers = HeaderMap::new();
        headers.add("Server", "squall");
        Self {
            conn,
            sequence,
            proto: if req.proto.is_empty() {
                "HTTP/1.1".to_string()
            } else {
                req.proto.clone()
            },
            proto_major: req.proto_major,
            proto_minor: req.proto_minor,
            status_code: 0,
            status: "",
            headers,
            body_list: Vec::new(),
            body_size: 0,
            upgrader: None,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn header(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Record the status once; repeated calls and unknown codes are
    /// ignored.
    pub fn write_header(&mut self, code: u16) {
        if self.status_code == 0 {
            let status = status_text(code);
            if !status.is_empty() {
                self.status = status;
                self.status_code = code;
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Append body bytes, splitting large payloads into bounded fragments.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.write_header(200);
        if data.is_empty() {
            return 0;
        }
        self.body_size += data.len();
        let mut rest = data;
        while !rest.is_empty() {
            let n = rest.len().min(BODY_FRAGMENT_SIZE);
            self.body_list.push(rest[..n].to_vec());
            rest = &rest[n..];
        }
        data.len()
    }

    /// Take over the underlying connection (used by protocol upgrades).
    pub fn hijack(&self) -> SquallResult<Arc<Conn>> {
        self.conn
            .clone()
            .ok_or_else(|| SquallError::Other("response has no connection".to_string()))
    }

    /// Install the post-upgrade byte handler; the parser adopts it after
    /// this response is queued.
    pub fn set_upgrader(&mut self, upgrader: Box<dyn Upgrader>) {
        self.upgrader = Some(upgrader);
    }

    pub(crate) fn take_upgrader(&mut self) -> Option<Box<dyn Upgrader>> {
        self.upgrader.take()
    }

    /// Replace whatever accumulated with a synthesized 500. Used when a
    /// handler panics before producing a response.
    pub(crate) fn reset_to_500(&mut self) {
        self.status_code = 500;
        self.status = status_text(500);
        self.body_list.clear();
        self.body_size = 0;
        let body = b"Internal Server Error";
        self.body_list.push(body.to_vec());
        self.body_size = body.len();
    }

    fn proto_at_least(&self, major: u8, minor: u8) -> bool {
        self.proto_major > major || (self.proto_major == major && self.proto_minor >= minor)
    }

    /// Serialize status line, headers, and body. Adds Content-Length or
    /// switches to chunked framing (with `Trailer-`-prefixed headers sent
    /// after the last chunk), and supplies default Content-Type, Date, and
    /// Server headers.
    pub fn encode(&mut self) -> Vec<u8> {
        self.write_header(200);

        let mut chunked = false;
        let mut encoding_found = false;
        if self.proto_at_least(1, 1) {
            for v in self.headers.get_all("Transfer-Encoding") {
                if v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")) {
                    chunked = true;
                    encoding_found = true;
                }
            }
            if !chunked && self.headers.get("Trailer").is_some() {
                chunked = true;
            }
        }
        if chunked {
            if !encoding_found {
                self.headers.add("Transfer-Encoding", "chunked");
            }
            self.headers.remove("Content-Length");
        } else if self.body_size > 0 && self.headers.get("Content-Length").is_none() {
            self.headers.add("Content-Length", self.body_size.to_string());
        }

        let mut data = Vec::with_capacity(self.body_size + 1024);
        data.extend_from_slice(self.proto.as_bytes());
        data.push(b' ');
        let code = self.status_code;
        data.push(b'0' + (code / 100) as u8);
        data.push(b'0' + ((code / 10) % 10) as u8);
        data.push(b'0' + (code % 10) as u8);
        data.push(b' ');
        data.extend_from_slice(self.status.as_bytes());
        data.extend_from_slice(b"\r\n");

        let mut trailers: Vec<(String, String)> = Vec::new();
        for (k, v) in self.headers.iter() {
            if k.starts_with("Trailer-") {
                trailers.push((k.to_string(), v.to_string()));
                continue;
            }
            data.extend_from_slice(k.as_bytes());
            data.extend_from_slice(b": ");
            data.extend_from_slice(v.as_bytes());
            data.extend_from_slice(b"\r\n");
        }

        if self.headers.get("Content-Type").is_none() {
            data.extend_from_slice(b"Content-Type: text/plain; charset=utf-8\r\n");
        }
        if self.headers.get("Date").is_none() {
            let now = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
            data.extend_from_slice(format!("Date: {}\r\n", now).as_bytes());
        }
        data.extend_from_slice(b"\r\n");

        if !chunked {
            for fragment in &self.body_list {
                data.extend_from_slice(fragment);
            }
        } else {
            for fragment in &self.body_list {
                data.extend_from_slice(format!("{:x}\r\n", fragment.len()).as_bytes());
                data.extend_from_slice(fragment);
                data.extend_from_slice(b"\r\n");
            }
            data.extend_from_slice(b"0\r\n");
            for (k, v) in &trailers {
                data.extend_from_slice(k.as_bytes());
                data.extend_from_slice(b": ");
                data.extend_from_slice(v.as_bytes());
                data.extend_from_slice(b"\r\n");
            }
            data.extend_from_slice(b"\r\n");
        }

        data
    }
}

// ---- Pipelined response ordering ----

struct QueueEntry {
    res: Response,
    req: Request,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.res.sequence == other.res.sequence
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed: BinaryHeap is a max-heap, we want the smallest sequence on
    // top.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.res.sequence.cmp(&self.res.sequence)
    }
}

/// Min-heap of responses keyed by request sequence. Responses become
/// writable strictly in sequence order.
#[derive(Default)]
pub struct ResponseQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl ResponseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, res: Response, req: Request) {
        self.heap.push(QueueEntry { res, req });
    }

    pub fn peek_seq(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.res.sequence)
    }

    pub fn pop(&mut self) -> Option<(Response, Request)> {
        self.heap.pop().map(|e| (e.res, e.req))
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        let mut req = Request::new();
        req.proto = "HTTP/1.1".to_string();
        req.proto_major = 1;
        req.proto_minor = 1;
        req
    }

    #[test]
    fn test_encode_with_content_length() {
        let req = request();
        let mut res = Response::new(None, &req, 1);
        res.write(b"hello");
        let bytes = res.encode();
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Server: squall\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_encode_chunked_with_trailer() {
        let req = request();
        let mut res = Response::new(None, &req, 1);
        res.header_mut().add("Trailer", "Trailer-Checksum");
        res.header_mut().add("Trailer-Checksum", "abc");
        res.write(b"Wiki");
        let text = String::from_utf8(res.encode()).expect("utf8");
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.contains("4\r\nWiki\r\n"));
        assert!(text.contains("0\r\nTrailer-Checksum: abc\r\n\r\n"));
    }

    #[test]
    fn test_write_header_records_once() {
        let req = request();
        let mut res = Response::new(None, &req, 1);
        res.write_header(404);
        res.write_header(200);
        assert_eq!(res.status_code(), 404);
    }

    #[test]
    fn test_large_write_fragments() {
        let req = request();
        let mut res = Response::new(None, &req, 1);
        let payload = vec![7u8; 10_000];
        res.write(&payload);
        assert_eq!(res.body_list.len(), 3);
        assert_eq!(res.body_size, 10_000);
        let bytes = res.encode();
        assert!(bytes.ends_with(&payload[payload.len() - 100..]));
    }

    #[test]
    fn test_queue_orders_by_sequence() {
        let mut q = ResponseQueue::new();
        for seq in [3u64, 1, 2] {
            let req = request();
            let res = Response::new(None, &req, seq);
            q.push(res, req);
        }
        assert_eq!(q.peek_seq(), Some(1));
        let order: Vec<u64> = std::iter::from_fn(|| q.pop().map(|(r, _)| r.sequence())).collect();
        assert_eq!(order, [1, 2, 3]);
    }
}

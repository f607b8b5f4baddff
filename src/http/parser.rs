//! Incremental HTTP/1.x parser.
//!
//! A pure byte state machine: every call to [`Parser::read`] advances over
//! the supplied bytes and emits callbacks on the installed
//! [`Processor`](crate::http::processor::Processor). Partial tokens carry
//! over between reads in the parser's accumulators, so the caller may feed
//! the stream in arbitrary fragments. Line endings are strictly CRLF.
//!
//! Once an upgrade completes (WebSocket, or the HTTP/2 preface), all
//! subsequent bytes are delegated verbatim to the installed [`Upgrader`].

use crate::error::{SquallError, SquallResult};
use crate::http::error::HttpError;
use crate::http::processor::Processor;
use std::borrow::Cow;

pub const DEFAULT_MAX_LINE: usize = 8 * 1024;
pub const DEFAULT_MAX_HEAD: usize = 64 * 1024;

/// Post-upgrade byte handler. After the parser switches into pass-through
/// mode, inbound bytes bypass the HTTP state machine entirely.
pub trait Upgrader: Send {
    fn read(&mut self, data: &[u8]) -> SquallResult<()>;
    fn close(&mut self, _err: &SquallError) {}
}

/// Parse `"HTTP/x.y"` into `(major, minor)`.
pub fn parse_http_version(proto: &str) -> Result<(u8, u8), HttpError> {
    let b = proto.as_bytes();
    if b.len() != 8 || &b[..5] != b"HTTP/" || b[6] != b'.' {
        return Err(HttpError::InvalidHTTPVersion);
    }
    if !b[5].is_ascii_digit() || !b[7].is_ascii_digit() {
        return Err(HttpError::InvalidHTTPVersion);
    }
    Ok((b[5] - b'0', b[7] - b'0'))
}

// Token octets per RFC 7230.
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

fn hex_val(b: u8) -> Option<usize> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as usize),
        b'a'..=b'f' => Some((b - b'a' + 10) as usize),
        b'A'..=b'F' => Some((b - b'A' + 10) as usize),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Method,
    UriBefore,
    Uri,
    ProtoBefore,
    Proto,
    ProtoLF,
    StatusCodeBefore,
    StatusCode,
    Status,
    StatusLF,
    HeaderKeyBefore,
    HeaderKey,
    HeaderValueBefore,
    HeaderValue,
    HeaderValueLF,
    HeadersDoneLF,
    BodyFixed,
    ChunkSize,
    ChunkSizeLF,
    ChunkData,
    ChunkDataCR,
    ChunkDataLF,
    TrailerKeyBefore,
    TrailerKey,
    TrailerValueBefore,
    TrailerValue,
    TrailerValueLF,
    TrailersDoneLF,
}

pub struct Parser {
    is_request: bool,
    state: State,

    tmp: Vec<u8>,
    value: Vec<u8>,
    header_key: String,

    status_code: u32,
    code_digits: u8,

    content_length: Option<usize>,
    chunked: bool,
    has_trailer: bool,
    seen_trailer: bool,
    chunk_final: bool,
    body_remain: usize,
    chunk_remain: usize,
    chunk_digits: u8,
    head_len: usize,

    max_line: usize,
    max_head: usize,

    pub processor: Box<dyn Processor>,
    pub upgrader: Option<Box<dyn Upgrader>>,
}

impl Parser {
    /// Request-side parser (server).
    pub fn new(processor: Box<dyn Processor>) -> Self {
        Self::build(true, processor)
    }

    /// Response-side parser (for callers driving a dialed connection).
    pub fn client(processor: Box<dyn Processor>) -> Self {
        Self::build(false, processor)
    }

    fn build(is_request: bool, processor: Box<dyn Processor>) -> Self {
        Self {
            is_request,
            state: State::Start,
            tmp: Vec::new(),
            value: Vec::new(),
            header_key: String::new(),
            status_code: 0,
            code_digits: 0,
            content_length: None,
            chunked: false,
            has_trailer: false,
            seen_trailer: false,
            chunk_final: false,
            body_remain: 0,
            chunk_remain: 0,
            chunk_digits: 0,
            head_len: 0,
            max_line: DEFAULT_MAX_LINE,
            max_head: DEFAULT_MAX_HEAD,
            processor,
            upgrader: None,
        }
    }

    pub fn with_limits(mut self, max_line: usize, max_head: usize) -> Self {
        self.max_line = max_line;
        self.max_head = max_head;
        self
    }

    /// Feed inbound bytes. Callbacks fire in network order; on error the
    /// caller must close the connection with the returned error.
    pub fn read(&mut self, data: &[u8]) -> SquallResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(up) = self.upgrader.as_mut() {
            return up.read(data);
        }
        self.parse(data)
    }

    fn push_tmp(&mut self, c: u8) -> SquallResult<()> {
        if self.tmp.len() >= self.max_line {
            return Err(HttpError::TooLong.into());
        }
        self.tmp.push(c);
        Ok(())
    }

    fn push_value(&mut self, c: u8) -> SquallResult<()> {
        if self.value.len() >= self.max_line {
            return Err(HttpError::TooLong.into());
        }
        self.value.push(c);
        Ok(())
    }

    fn take_tmp_str(&mut self, err: HttpError) -> SquallResult<String> {
        String::from_utf8(std::mem::take(&mut self.tmp)).map_err(|_| err.into())
    }

    fn finish_header(&mut self, trailer: bool) -> SquallResult<()> {
        let key = std::mem::take(&mut self.header_key);
        let raw = std::mem::take(&mut self.value);
        let mut value =
            String::from_utf8(raw).map_err(|_| SquallError::from(HttpError::InvalidCharInHeader))?;
        value.truncate(value.trim_end_matches([' ', '\t']).len());

        self.head_len += key.len() + value.len() + 4;
        if self.head_len > self.max_head {
            return Err(HttpError::TooLong.into());
        }

        if trailer {
            self.processor.on_trailer_header(key, value);
            self.seen_trailer = true;
            return Ok(());
        }

        if key.eq_ignore_ascii_case("content-length") {
            if self.chunked {
                return Err(HttpError::UnexpectedContentLength.into());
            }
            if self.content_length.is_some() {
                return Err(HttpError::InvalidContentLength.into());
            }
            let n: usize = value
                .trim()
                .parse()
                .map_err(|_| SquallError::from(HttpError::InvalidContentLength))?;
            self.content_length = Some(n);
            self.processor.on_content_length(n);
        } else if key.eq_ignore_ascii_case("transfer-encoding") {
            let has_chunked = value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"));
            if has_chunked {
                if self.content_length.is_some() {
                    return Err(HttpError::UnexpectedContentLength.into());
                }
                self.chunked = true;
            }
        } else if key.eq_ignore_ascii_case("trailer") {
            self.has_trailer = true;
        }

        self.processor.on_header(key, value);
        Ok(())
    }

    fn finish_message(&mut self) {
        self.processor.on_complete(&mut self.upgrader);
        self.content_length = None;
        self.chunked = false;
        self.has_trailer = false;
        self.seen_trailer = false;
        self.chunk_final = false;
        self.body_remain = 0;
        self.chunk_remain = 0;
        self.chunk_digits = 0;
        self.status_code = 0;
        self.code_digits = 0;
        self.head_len = 0;
        self.tmp.clear();
        self.value.clear();
        self.header_key.clear();
        self.state = State::Start;
    }

    fn delegate_rest(&mut self, buf: &[u8], i: usize) -> SquallResult<()> {
        if i < buf.len() {
            if let Some(up) = self.upgrader.as_mut() {
                up.read(&buf[i..])?;
            }
        }
        Ok(())
    }

    fn parse(&mut self, buf: &[u8]) -> SquallResult<()> {
        let mut i = 0;
        while i < buf.len() {
            let c = buf[i];
            match self.state {
                State::Start => {
                    // Tolerate blank lines between pipelined messages.
                    if c == b'\r' || c == b'\n' {
                        i += 1;
                        continue;
                    }
                    self.state = if self.is_request {
                        State::Method
                    } else {
                        State::Proto
                    };
                }
                State::Method => {
                    if c == b' ' {
                        let method = self.take_tmp_str(HttpError::InvalidMethod)?;
                        if method.is_empty() {
                            return Err(HttpError::InvalidMethod.into());
                        }
                        self.processor.on_method(&method);
                        self.state = State::UriBefore;
                        i += 1;
                    } else if is_token_char(c) {
                        self.push_tmp(c)?;
                        i += 1;
                    } else {
                        return Err(HttpError::InvalidMethod.into());
                    }
                }
                State::UriBefore => {
                    if c == b' ' {
                        i += 1;
                    } else {
                        self.state = State::Uri;
                    }
                }
                State::Uri => {
                    if c == b' ' {
                        let uri = self.take_tmp_str(HttpError::InvalidRequestURI)?;
                        if uri.is_empty() {
                            return Err(HttpError::InvalidRequestURI.into());
                        }
                        self.processor.on_url(&uri).map_err(SquallError::Http)?;
                        self.state = State::ProtoBefore;
                        i += 1;
                    } else if c <= 0x20 || c == 0x7f {
                        return Err(HttpError::InvalidRequestURI.into());
                    } else {
                        self.push_tmp(c)?;
                        i += 1;
                    }
                }
                State::ProtoBefore => {
                    if c == b' ' {
                        i += 1;
                    } else {
                        self.state = State::Proto;
                    }
                }
                State::Proto => {
                    let end = if self.is_request {
                        c == b'\r'
                    } else {
                        c == b' '
                    };
                    if end {
                        let proto = self.take_tmp_str(HttpError::InvalidHTTPVersion)?;
                        parse_http_version(&proto)?;
                        self.processor.on_proto(&proto).map_err(SquallError::Http)?;
                        self.state = if self.is_request {
                            State::ProtoLF
                        } else {
                            State::StatusCodeBefore
                        };
                        i += 1;
                    } else if c == b'\n' || (self.is_request && c == b' ') {
                        return Err(HttpError::InvalidHTTPVersion.into());
                    } else {
                        self.push_tmp(c)?;
                        i += 1;
                    }
                }
                State::ProtoLF | State::StatusLF => {
                    if c != b'\n' {
                        return Err(HttpError::LFExpected.into());
                    }
                    self.state = State::HeaderKeyBefore;
                    i += 1;
                }
                State::StatusCodeBefore => {
                    if c == b' ' {
                        i += 1;
                    } else {
                        self.state = State::StatusCode;
                    }
                }
                State::StatusCode => {
                    if c.is_ascii_digit() {
                        self.status_code = self.status_code * 10 + (c - b'0') as u32;
                        self.code_digits += 1;
                        if self.code_digits > 3 {
                            return Err(HttpError::InvalidHTTPStatusCode.into());
                        }
                        i += 1;
                    } else if c == b' ' || c == b'\r' {
                        if self.code_digits != 3 {
                            return Err(HttpError::InvalidHTTPStatusCode.into());
                        }
                        if c == b'\r' {
                            let code = self.status_code as u16;
                            self.processor.on_status(code, "");
                            self.state = State::StatusLF;
                        } else {
                            self.state = State::Status;
                        }
                        i += 1;
                    } else {
                        return Err(HttpError::InvalidHTTPStatusCode.into());
                    }
                }
                State::Status => {
                    if c == b'\r' {
                        let text = self.take_tmp_str(HttpError::InvalidHTTPStatus)?;
                        let code = self.status_code as u16;
                        self.processor.on_status(code, &text);
                        self.state = State::StatusLF;
                        i += 1;
                    } else if c == b'\n' {
                        return Err(HttpError::CRExpected.into());
                    } else {
                        self.push_tmp(c)?;
                        i += 1;
                    }
                }
                State::HeaderKeyBefore => {
                    if c == b'\r' {
                        self.state = State::HeadersDoneLF;
                        i += 1;
                    } else if c == b'\n' {
                        return Err(HttpError::CRExpected.into());
                    } else {
                        self.state = State::HeaderKey;
                    }
                }
                State::HeaderKey => {
                    if c == b':' {
                        self.header_key = self.take_tmp_str(HttpError::InvalidCharInHeader)?;
                        if self.header_key.is_empty() {
                            return Err(HttpError::InvalidCharInHeader.into());
                        }
                        self.state = State::HeaderValueBefore;
                        i += 1;
                    } else if is_token_char(c) {
                        self.push_tmp(c)?;
                        i += 1;
                    } else {
                        return Err(HttpError::InvalidCharInHeader.into());
                    }
                }
                State::HeaderValueBefore => {
                    if c == b' ' || c == b'\t' {
                        i += 1;
                    } else {
                        self.state = State::HeaderValue;
                    }
                }
                State::HeaderValue => {
                    if c == b'\r' {
                        self.state = State::HeaderValueLF;
                        i += 1;
                    } else if c == b'\n' {
                        return Err(HttpError::CRExpected.into());
                    } else if c < 0x20 && c != b'\t' {
                        return Err(HttpError::InvalidCharInHeader.into());
                    } else {
                        self.push_value(c)?;
                        i += 1;
                    }
                }
                State::HeaderValueLF => {
                    if c != b'\n' {
                        return Err(HttpError::LFExpected.into());
                    }
                    self.finish_header(false)?;
                    self.state = State::HeaderKeyBefore;
                    i += 1;
                }
                State::HeadersDoneLF => {
                    if c != b'\n' {
                        return Err(HttpError::LFExpected.into());
                    }
                    i += 1;
                    if self.chunked {
                        self.state = State::ChunkSize;
                        self.chunk_remain = 0;
                        self.chunk_digits = 0;
                    } else {
                        let n = self.content_length.unwrap_or(0);
                        if n > 0 {
                            self.body_remain = n;
                            self.state = State::BodyFixed;
                        } else {
                            self.finish_message();
                            if self.upgrader.is_some() {
                                return self.delegate_rest(buf, i);
                            }
                        }
                    }
                }
                State::BodyFixed => {
                    let take = (buf.len() - i).min(self.body_remain);
                    self.processor.on_body(Cow::Borrowed(&buf[i..i + take]));
                    i += take;
                    self.body_remain -= take;
                    if self.body_remain == 0 {
                        self.finish_message();
                        if self.upgrader.is_some() {
                            return self.delegate_rest(buf, i);
                        }
                    }
                }
                State::ChunkSize => {
                    if let Some(v) = hex_val(c) {
                        self.chunk_remain = self
                            .chunk_remain
                            .checked_mul(16)
                            .and_then(|x| x.checked_add(v))
                            .ok_or(SquallError::Http(HttpError::InvalidChunkSize))?;
                        self.chunk_digits += 1;
                        if self.chunk_digits > 16 {
                            return Err(HttpError::InvalidChunkSize.into());
                        }
                        i += 1;
                    } else if c == b'\r' {
                        if self.chunk_digits == 0 {
                            return Err(HttpError::InvalidChunkSize.into());
                        }
                        self.state = State::ChunkSizeLF;
                        i += 1;
                    } else {
                        return Err(HttpError::InvalidChunkSize.into());
                    }
                }
                State::ChunkSizeLF => {
                    if c != b'\n' {
                        return Err(HttpError::LFExpected.into());
                    }
                    i += 1;
                    if self.chunk_remain == 0 {
                        if self.has_trailer {
                            self.state = State::TrailerKeyBefore;
                        } else {
                            self.chunk_final = true;
                            self.state = State::ChunkDataCR;
                        }
                    } else {
                        self.state = State::ChunkData;
                    }
                }
                State::ChunkData => {
                    let take = (buf.len() - i).min(self.chunk_remain);
                    self.processor.on_body(Cow::Borrowed(&buf[i..i + take]));
                    i += take;
                    self.chunk_remain -= take;
                    if self.chunk_remain == 0 {
                        self.state = State::ChunkDataCR;
                    }
                }
                State::ChunkDataCR => {
                    if c != b'\r' {
                        return Err(HttpError::CRExpected.into());
                    }
                    self.state = State::ChunkDataLF;
                    i += 1;
                }
                State::ChunkDataLF => {
                    if c != b'\n' {
                        return Err(HttpError::LFExpected.into());
                    }
                    i += 1;
                    if self.chunk_final {
                        self.finish_message();
                        if self.upgrader.is_some() {
                            return self.delegate_rest(buf, i);
                        }
                    } else {
                        self.state = State::ChunkSize;
                        self.chunk_digits = 0;
                    }
                }
                State::TrailerKeyBefore => {
                    if c == b'\r' {
                        if !self.seen_trailer {
                            return Err(HttpError::TrailerExpected.into());
                        }
                        self.state = State::TrailersDoneLF;
                        i += 1;
                    } else if c == b'\n' {
                        return Err(HttpError::CRExpected.into());
                    } else {
                        self.state = State::TrailerKey;
                    }
                }
                State::TrailerKey => {
                    if c == b':' {
                        self.header_key = self.take_tmp_str(HttpError::InvalidCharInHeader)?;
                        if self.header_key.is_empty() {
                            return Err(HttpError::InvalidCharInHeader.into());
                        }
                        self.state = State::TrailerValueBefore;
                        i += 1;
                    } else if is_token_char(c) {
                        self.push_tmp(c)?;
                        i += 1;
                    } else {
                        return Err(HttpError::InvalidCharInHeader.into());
                    }
                }
                State::TrailerValueBefore => {
                    if c == b' ' || c == b'\t' {
                        i += 1;
                    } else {
                        self.state = State::TrailerValue;
                    }
                }
                State::TrailerValue => {
                    if c == b'\r' {
                        self.state = State::TrailerValueLF;
                        i += 1;
                    } else if c == b'\n' {
                        return Err(HttpError::CRExpected.into());
                    } else if c < 0x20 && c != b'\t' {
                        return Err(HttpError::InvalidCharInHeader.into());
                    } else {
                        self.push_value(c)?;
                        i += 1;
                    }
                }
                State::TrailerValueLF => {
                    if c != b'\n' {
                        return Err(HttpError::LFExpected.into());
                    }
                    self.finish_header(true)?;
                    self.state = State::TrailerKeyBefore;
                    i += 1;
                }
                State::TrailersDoneLF => {
                    if c != b'\n' {
                        return Err(HttpError::LFExpected.into());
                    }
                    i += 1;
                    self.finish_message();
                    if self.upgrader.is_some() {
                        return self.delegate_rest(buf, i);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default, PartialEq, Clone)]
    struct Recorded {
        method: String,
        uri: String,
        proto: String,
        status: Option<(u16, String)>,
        headers: Vec<(String, String)>,
        trailers: Vec<(String, String)>,
        content_length: Option<usize>,
        body: Vec<u8>,
        complete: usize,
    }

    struct Recorder {
        out: Rc<RefCell<Vec<Recorded>>>,
        current: Recorded,
    }

    // Test-only; the parser is single-threaded here.
    unsafe impl Send for Recorder {}

    impl Recorder {
        fn new(out: Rc<RefCell<Vec<Recorded>>>) -> Self {
            Self {
                out,
                current: Recorded::default(),
            }
        }
    }

    impl Processor for Recorder {
        fn on_method(&mut self, method: &str) {
            self.current.method = method.to_string();
        }
        fn on_url(&mut self, uri: &str) -> Result<(), HttpError> {
            self.current.uri = uri.to_string();
            Ok(())
        }
        fn on_proto(&mut self, proto: &str) -> Result<(), HttpError> {
            self.current.proto = proto.to_string();
            Ok(())
        }
        fn on_status(&mut self, code: u16, status: &str) {
            self.current.status = Some((code, status.to_string()));
        }
        fn on_header(&mut self, key: String, value: String) {
            self.current.headers.push((key, value));
        }
        fn on_content_length(&mut self, n: usize) {
            self.current.content_length = Some(n);
        }
        fn on_body(&mut self, data: Cow<'_, [u8]>) {
            self.current.body.extend_from_slice(&data);
        }
        fn on_trailer_header(&mut self, key: String, value: String) {
            self.current.trailers.push((key, value));
        }
        fn on_complete(&mut self, _upgrader: &mut Option<Box<dyn Upgrader>>) {
            self.current.complete += 1;
            let done = std::mem::take(&mut self.current);
            self.out.borrow_mut().push(done);
        }
    }

    fn feed_whole(input: &[u8]) -> Vec<Recorded> {
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut parser = Parser::new(Box::new(Recorder::new(out.clone())));
        parser.read(input).expect("parse failed");
        let result = out.borrow().clone();
        result
    }

    fn feed_bytewise(input: &[u8]) -> Vec<Recorded> {
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut parser = Parser::new(Box::new(Recorder::new(out.clone())));
        for b in input {
            parser.read(std::slice::from_ref(b)).expect("parse failed");
        }
        let result = out.borrow().clone();
        result
    }

    fn parse_err(input: &[u8]) -> HttpError {
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut parser = Parser::new(Box::new(Recorder::new(out)));
        match parser.read(input) {
            Err(SquallError::Http(e)) => e,
            other => panic!("expected parse error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_basic_request_with_body() {
        let input = b"GET /echo HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello";
        let msgs = feed_whole(input);
        assert_eq!(msgs.len(), 1);
        let m = &msgs[0];
        assert_eq!(m.method, "GET");
        assert_eq!(m.uri, "/echo");
        assert_eq!(m.proto, "HTTP/1.1");
        assert_eq!(m.content_length, Some(5));
        assert_eq!(m.body, b"hello");
        assert_eq!(
            m.headers,
            vec![
                ("Host".to_string(), "h".to_string()),
                ("Content-Length".to_string(), "5".to_string())
            ]
        );
    }

    #[test]
    fn test_bytewise_matches_single_shot() {
        let input =
            b"POST /submit?q=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 11\r\n\r\nhello world";
        assert_eq!(feed_whole(input), feed_bytewise(input));
    }

    #[test]
    fn test_pipelined_requests() {
        let input = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let msgs = feed_whole(input);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].uri, "/a");
        assert_eq!(msgs[1].uri, "/b");
    }

    #[test]
    fn test_chunked_body_with_trailers() {
        let input = b"POST /up HTTP/1.1\r\nHost: h\r\nTrailer: Checksum\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\nChecksum: abc\r\n\r\n";
        let msgs = feed_whole(input);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body, b"Wikipedia");
        assert_eq!(
            msgs[0].trailers,
            vec![("Checksum".to_string(), "abc".to_string())]
        );
    }

    #[test]
    fn test_chunked_without_trailers() {
        let input =
            b"POST /up HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let msgs = feed_whole(input);
        assert_eq!(msgs[0].body, b"abc");
    }

    #[test]
    fn test_content_length_and_chunked_conflict() {
        let input = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(parse_err(input), HttpError::UnexpectedContentLength);

        let reversed = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n";
        assert_eq!(parse_err(reversed), HttpError::UnexpectedContentLength);
    }

    #[test]
    fn test_bare_lf_is_rejected() {
        assert_eq!(
            parse_err(b"GET / HTTP/1.1\r\nHost: h\nX: y\r\n\r\n"),
            HttpError::CRExpected
        );
    }

    #[test]
    fn test_cr_without_lf_is_rejected() {
        assert_eq!(
            parse_err(b"GET / HTTP/1.1\r\nHost: h\rX"),
            HttpError::LFExpected
        );
    }

    #[test]
    fn test_invalid_method_char() {
        assert_eq!(parse_err(b"G@T / HTTP/1.1\r\n\r\n"), HttpError::InvalidMethod);
    }

    #[test]
    fn test_invalid_version() {
        assert_eq!(
            parse_err(b"GET / HTTP/11\r\n\r\n"),
            HttpError::InvalidHTTPVersion
        );
    }

    #[test]
    fn test_invalid_content_length_value() {
        assert_eq!(
            parse_err(b"GET / HTTP/1.1\r\nContent-Length: abc\r\n\r\n"),
            HttpError::InvalidContentLength
        );
    }

    #[test]
    fn test_invalid_chunk_size() {
        assert_eq!(
            parse_err(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"),
            HttpError::InvalidChunkSize
        );
    }

    #[test]
    fn test_line_too_long() {
        let mut input = b"GET /".to_vec();
        input.extend(std::iter::repeat(b'a').take(DEFAULT_MAX_LINE + 1));
        input.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        assert_eq!(parse_err(&input), HttpError::TooLong);
    }

    #[test]
    fn test_trailer_declared_but_missing() {
        let input = b"POST / HTTP/1.1\r\nTrailer: X\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
        assert_eq!(parse_err(input), HttpError::TrailerExpected);
    }

    #[test]
    fn test_response_parsing() {
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut parser = Parser::client(Box::new(Recorder::new(out.clone())));
        parser
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .expect("parse failed");
        let msgs = out.borrow().clone();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].status, Some((200, "OK".to_string())));
        assert_eq!(msgs[0].body, b"ok");
    }

    #[test]
    fn test_parse_http_version() {
        assert_eq!(parse_http_version("HTTP/1.1"), Ok((1, 1)));
        assert_eq!(parse_http_version("HTTP/2.0"), Ok((2, 0)));
        assert!(parse_http_version("HTTP/1").is_err());
        assert!(parse_http_version("HTP/1.1").is_err());
    }
}

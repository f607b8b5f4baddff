//! HTTP message types: the case-preserving header map, the in-progress
//! request, and the pooled body accumulator.

use crate::pool;
use std::net::SocketAddr;

/// Multi-valued header map. Names keep the spelling they arrived with;
/// lookup is case-insensitive. Insertion order is preserved, which keeps
/// multi-value order within a name stable.
#[derive(Debug, Default, Clone)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replace all values for `key`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.remove(key);
        self.entries.push((key.to_string(), value.into()));
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// True when any value for `key` contains `token` in its
    /// comma-separated list, compared case-insensitively.
    pub fn contains_token(&self, key: &str, token: &str) -> bool {
        self.get_all(key)
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accumulates body bytes in a pooled buffer.
#[derive(Debug, Default)]
pub struct BodyReader {
    data: Option<Vec<u8>>,
}

impl BodyReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        match self.data.take() {
            Some(buf) => {
                let old = buf.len();
                let mut buf = pool::realloc(buf, old + chunk.len());
                buf[old..].copy_from_slice(chunk);
                self.data = Some(buf);
            }
            None => {
                let mut buf = pool::malloc(chunk.len());
                buf.copy_from_slice(chunk);
                self.data = Some(buf);
            }
        }
    }

    /// Adopt a pooled buffer wholesale when nothing has accumulated yet.
    pub fn adopt(&mut self, buf: Vec<u8>) {
        match self.data.take() {
            Some(existing) => {
                self.data = Some(existing);
                self.append_owned(buf);
            }
            None => self.data = Some(buf),
        }
    }

    fn append_owned(&mut self, buf: Vec<u8>) {
        self.append(&buf);
        pool::free(buf);
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        if let Some(buf) = self.data.take() {
            pool::free(buf);
        }
    }
}

/// A request in progress, published to the handler on completion.
#[derive(Debug, Default)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub proto: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    pub headers: HeaderMap,
    pub trailers: HeaderMap,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub body: BodyReader,
    /// The connection must close after this request's response.
    pub close: bool,
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("Host")
    }

    pub fn proto_at_least(&self, major: u8, minor: u8) -> bool {
        self.proto_major > major || (self.proto_major == major && self.proto_minor >= minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_case_insensitive_lookup() {
        let mut h = HeaderMap::new();
        h.add("Content-Length", "5");
        assert_eq!(h.get("content-length"), Some("5"));
        assert_eq!(h.get("CONTENT-LENGTH"), Some("5"));
        assert_eq!(h.get("missing"), None);
    }

    #[test]
    fn test_header_map_multi_value_order() {
        let mut h = HeaderMap::new();
        h.add("Set-Cookie", "a=1");
        h.add("set-cookie", "b=2");
        let all: Vec<&str> = h.get_all("Set-Cookie").collect();
        assert_eq!(all, ["a=1", "b=2"]);
    }

    #[test]
    fn test_contains_token() {
        let mut h = HeaderMap::new();
        h.add("Connection", "keep-alive, Upgrade");
        assert!(h.contains_token("connection", "upgrade"));
        assert!(h.contains_token("Connection", "keep-alive"));
        assert!(!h.contains_token("Connection", "close"));
    }

    #[test]
    fn test_body_reader_accumulates() {
        let mut b = BodyReader::new();
        b.append(b"hel");
        b.append(b"lo");
        assert_eq!(b.bytes(), b"hello");
        assert_eq!(b.len(), 5);
    }
}

//! End-to-end HTTP tests over real sockets.

use squall::http::HttpServer;
use squall::Config;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

fn config() -> Config {
    Config {
        addrs: vec!["127.0.0.1:0".to_string()],
        n_poller: 2,
        ..Config::default()
    }
}

/// Buffered reader for possibly-pipelined HTTP responses.
struct ResponseReader {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl ResponseReader {
    fn new(stream: TcpStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn fill(&mut self) {
        let mut tmp = [0u8; 4096];
        let n = self.stream.read(&mut tmp).expect("read");
        assert!(n > 0, "connection closed mid-response");
        self.buf.extend_from_slice(&tmp[..n]);
    }

    fn find_header_end(&self) -> Option<usize> {
        self.buf
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p + 4)
    }

    /// Read one response; returns (head, body).
    fn next(&mut self) -> (String, Vec<u8>) {
        let header_end = loop {
            if let Some(end) = self.find_header_end() {
                break end;
            }
            self.fill();
        };
        let head = String::from_utf8(self.buf[..header_end].to_vec()).expect("utf8 head");
        let content_length = head
            .lines()
            .find_map(|line| {
                let (k, v) = line.split_once(':')?;
                if k.trim().eq_ignore_ascii_case("content-length") {
                    v.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        while self.buf.len() < header_end + content_length {
            self.fill();
        }
        let body = self.buf[header_end..header_end + content_length].to_vec();
        self.buf.drain(..header_end + content_length);
        (head, body)
    }
}

#[test]
fn test_echo_request_body() {
    let mut server = HttpServer::new(config(), |res, req| {
        let body = req.body.bytes().to_vec();
        res.write(&body);
    });
    server.start().expect("start");
    let addr = server.local_addrs()[0];

    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .write_all(b"GET /echo HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello")
        .expect("write");

    let mut reader = ResponseReader::new(stream);
    let (head, body) = reader.next();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert!(head.contains("Content-Length: 5\r\n"));
    assert_eq!(body, b"hello");

    server.stop();
}

#[test]
fn test_pipelined_responses_arrive_in_request_order() {
    // Handlers complete in reverse order; the wire order must still be
    // request order.
    let mut server = HttpServer::new(config(), |res, req| {
        let delay = match req.uri.as_str() {
            "/a" => 80,
            "/b" => 40,
            _ => 0,
        };
        std::thread::sleep(Duration::from_millis(delay));
        res.write(req.uri.as_bytes());
    })
    .with_executor(|job| {
        std::thread::spawn(move || job());
    });
    server.start().expect("start");
    let addr = server.local_addrs()[0];

    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n\
              GET /b HTTP/1.1\r\nHost: h\r\n\r\n\
              GET /c HTTP/1.1\r\nHost: h\r\n\r\n",
        )
        .expect("write");

    let mut reader = ResponseReader::new(stream);
    let bodies: Vec<Vec<u8>> = (0..3).map(|_| reader.next().1).collect();
    assert_eq!(bodies, vec![b"/a".to_vec(), b"/b".to_vec(), b"/c".to_vec()]);

    server.stop();
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let mut server = HttpServer::new(config(), |res, req| {
        res.write(req.uri.as_bytes());
    });
    server.start().expect("start");
    let addr = server.local_addrs()[0];

    let stream = TcpStream::connect(addr).expect("connect");
    let mut reader = ResponseReader::new(stream);

    reader
        .stream
        .write_all(b"GET /first HTTP/1.1\r\nHost: h\r\n\r\n")
        .expect("write");
    let (head, body) = reader.next();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"/first");

    reader
        .stream
        .write_all(b"GET /second HTTP/1.1\r\nHost: h\r\n\r\n")
        .expect("write");
    let (_, body) = reader.next();
    assert_eq!(body, b"/second");

    server.stop();
}

#[test]
fn test_connection_close_honored() {
    let mut server = HttpServer::new(config(), |res, _req| {
        res.write(b"bye");
    });
    server.start().expect("start");
    let addr = server.local_addrs()[0];

    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .expect("write");

    let mut reader = ResponseReader::new(stream);
    let (_, body) = reader.next();
    assert_eq!(body, b"bye");

    // Server closes after the response.
    let mut tail = [0u8; 1];
    let n = reader.stream.read(&mut tail).unwrap_or(0);
    assert_eq!(n, 0);

    server.stop();
}

#[test]
fn test_handler_panic_yields_500() {
    let mut server = HttpServer::new(config(), |res, req| {
        if req.uri == "/panic" {
            panic!("handler exploded");
        }
        res.write(b"ok");
    });
    server.start().expect("start");
    let addr = server.local_addrs()[0];

    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .write_all(b"GET /panic HTTP/1.1\r\nHost: h\r\n\r\n")
        .expect("write");

    let mut reader = ResponseReader::new(stream);
    let (head, _) = reader.next();
    assert!(head.starts_with("HTTP/1.1 500 "), "head: {head}");

    // The poller survived; the same connection serves another request.
    reader
        .stream
        .write_all(b"GET /fine HTTP/1.1\r\nHost: h\r\n\r\n")
        .expect("write");
    let (head, body) = reader.next();
    assert!(head.starts_with("HTTP/1.1 200 "));
    assert_eq!(body, b"ok");

    server.stop();
}

#[test]
fn test_parse_error_closes_connection() {
    let mut server = HttpServer::new(config(), |res, _req| {
        res.write(b"unreachable");
    });
    server.start().expect("start");
    let addr = server.local_addrs()[0];

    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    stream
        .write_all(b"GET / HTTP/1.1\r\nBad\x01Header: x\r\n\r\n")
        .expect("write");

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "connection should close without a response");

    server.stop();
}

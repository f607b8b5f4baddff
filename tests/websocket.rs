//! End-to-end WebSocket tests: handshake, masked frames, fragmentation.

use squall::http::HttpServer;
use squall::ws::{MessageKind, WsUpgrader, FRAME_PAYLOAD_SIZE};
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

fn ws_echo_server() -> HttpServer {
    let mut server = HttpServer::new(config(), |res, req| {
        if req.uri == "/ws" {
            let upgrader = WsUpgrader::new();
            match upgrader.upgrade(res, req) {
                Ok(ws) => {
                    ws.set_message_handler(|ws, kind, payload| {
                        let _ = ws.write_message(kind, payload);
                    });
                }
                Err(_) => {}
            }
        } else {
            res.write(b"not a websocket endpoint");
        }
    });
    server.start().expect("start");
    server
}

fn handshake(addr: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: h\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .expect("write handshake");

    let head = read_until_blank_line(&mut stream);
    assert!(
        head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "head: {head}"
    );
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(head.contains("Upgrade: websocket\r\n"));
    stream
}

fn read_until_blank_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("read head");
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            return String::from_utf8(buf).expect("utf8 head");
        }
    }
}

fn send_masked_frame(stream: &mut TcpStream, fin: bool, opcode: u8, payload: &[u8]) {
    let mut frame = Vec::new();
    frame.push(opcode | if fin { 0x80 } else { 0 });
    let plen = payload.len();
    if plen < 126 {
        frame.push(0x80 | plen as u8);
    } else if plen < 65536 {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(plen as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(plen as u64).to_be_bytes());
    }
    let mask = [0x37, 0xfa, 0x21, 0x3d];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    stream.write_all(&frame).expect("write frame");
}

/// Read one unmasked server frame: (fin, opcode, payload).
fn read_frame(stream: &mut TcpStream) -> (bool, u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).expect("read frame head");
    let fin = head[0] & 0x80 != 0;
    let opcode = head[0] & 0x0F;
    assert_eq!(head[1] & 0x80, 0, "server frames must be unmasked");
    let len7 = (head[1] & 0x7F) as usize;
    let plen = match len7 {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).expect("read ext len");
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).expect("read ext len");
            u64::from_be_bytes(ext) as usize
        }
        n => n,
    };
    let mut payload = vec![0u8; plen];
    stream.read_exact(&mut payload).expect("read payload");
    (fin, opcode, payload)
}

#[test]
fn test_upgrade_and_text_echo() {
    let mut server = ws_echo_server();
    let addr = server.local_addrs()[0];
    let mut stream = handshake(addr);

    send_masked_frame(&mut stream, true, MessageKind::Text.opcode(), b"hello world");
    let (fin, opcode, payload) = read_frame(&mut stream);
    assert!(fin);
    assert_eq!(opcode, MessageKind::Text.opcode());
    assert_eq!(payload, b"hello world");

    server.stop();
}

#[test]
fn test_client_fragments_reassemble() {
    let mut server = ws_echo_server();
    let addr = server.local_addrs()[0];
    let mut stream = handshake(addr);

    // Three fragments, continuation opcodes, FIN on the last.
    send_masked_frame(&mut stream, false, MessageKind::Text.opcode(), b"one ");
    send_masked_frame(&mut stream, false, 0x0, b"two ");
    send_masked_frame(&mut stream, true, 0x0, b"three");

    let (fin, opcode, payload) = read_frame(&mut stream);
    assert!(fin);
    assert_eq!(opcode, MessageKind::Text.opcode());
    assert_eq!(payload, b"one two three");

    server.stop();
}

#[test]
fn test_large_binary_message_fragments_outbound() {
    let mut server = ws_echo_server();
    let addr = server.local_addrs()[0];
    let mut stream = handshake(addr);

    let message: Vec<u8> = (0..9 * 1024).map(|i| (i % 251) as u8).collect();
    send_masked_frame(&mut stream, true, MessageKind::Binary.opcode(), &message);

    // The echo comes back as ceil(9216 / 4082) = 3 frames, FIN only on
    // the last, opcode only on the first.
    let mut frames = Vec::new();
    loop {
        let (fin, opcode, payload) = read_frame(&mut stream);
        frames.push((fin, opcode, payload));
        if fin {
            break;
        }
    }
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].1, MessageKind::Binary.opcode());
    assert_eq!(frames[0].2.len(), FRAME_PAYLOAD_SIZE);
    assert_eq!(frames[1].1, 0x0);
    assert!(!frames[0].0 && !frames[1].0 && frames[2].0);

    let reassembled: Vec<u8> = frames.into_iter().flat_map(|(_, _, p)| p).collect();
    assert_eq!(reassembled, message);

    server.stop();
}

#[test]
fn test_ping_gets_pong() {
    let mut server = ws_echo_server();
    let addr = server.local_addrs()[0];
    let mut stream = handshake(addr);

    send_masked_frame(&mut stream, true, MessageKind::Ping.opcode(), b"beat");
    let (fin, opcode, payload) = read_frame(&mut stream);
    assert!(fin);
    assert_eq!(opcode, MessageKind::Pong.opcode());
    assert_eq!(payload, b"beat");

    server.stop();
}

#[test]
fn test_close_is_echoed() {
    let mut server = ws_echo_server();
    let addr = server.local_addrs()[0];
    let mut stream = handshake(addr);

    let mut payload = 1000u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"done");
    send_masked_frame(&mut stream, true, MessageKind::Close.opcode(), &payload);

    let (fin, opcode, echoed) = read_frame(&mut stream);
    assert!(fin);
    assert_eq!(opcode, MessageKind::Close.opcode());
    assert_eq!(echoed, payload);

    // The server tears the connection down after the close exchange.
    let mut tail = [0u8; 1];
    let n = stream.read(&mut tail).unwrap_or(0);
    assert_eq!(n, 0);

    server.stop();
}

#[test]
fn test_rejected_handshake_without_key() {
    let mut server = ws_echo_server();
    let addr = server.local_addrs()[0];

    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: h\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .expect("write");

    let head = read_until_blank_line(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 "), "head: {head}");

    server.stop();
}

//! Upgrade handshake and the incremental frame engine.
//!
//! `WsUpgrader::upgrade` validates the handshake from inside an HTTP
//! handler, queues the `101 Switching Protocols` response through the
//! normal pipeline, and installs a `WsSession` as the parser's
//! pass-through byte handler. The session buffers partial reads in a
//! pooled buffer, deframes complete frames in place, reassembles
//! fragmented messages, and dispatches to the connection's handlers.

use super::conn::{MessageKind, WsConn};
use super::{accept_key, WsError};
use crate::error::{SquallError, SquallResult};
use crate::http::message::Request;
use crate::http::parser::Upgrader;
use crate::http::response::Response;
use crate::pool;
use std::sync::Arc;
use std::time::Duration;

type OriginCheck = Box<dyn Fn(&Request) -> bool + Send + Sync>;

/// WebSocket handshake options. One upgrader serves one connection.
#[derive(Default)]
pub struct WsUpgrader {
    /// Advertise permessage-deflate when the client offers it. The engine
    /// never compresses; this only mirrors the offer back.
    pub enable_compression: bool,
    /// Write deadline applied while the 101 response is in flight.
    pub handshake_timeout: Option<Duration>,
    /// Supported subprotocols in preference order.
    pub subprotocols: Vec<String>,
    /// Origin policy; defaults to same-origin.
    pub check_origin: Option<OriginCheck>,
}

fn origin_host(origin: &str) -> &str {
    let rest = origin
        .find("://")
        .map(|i| &origin[i + 3..])
        .unwrap_or(origin);
    rest.split('/').next().unwrap_or("")
}

fn check_same_origin(req: &Request) -> bool {
    match req.headers.get("Origin") {
        None => true,
        Some(origin) => match req.host() {
            Some(host) => origin_host(origin).eq_ignore_ascii_case(host),
            None => false,
        },
    }
}

fn fail(res: &mut Response, code: u16, msg: &'static str) -> SquallError {
    res.header_mut().set("Sec-WebSocket-Version", "13");
    res.write_header(code);
    res.write(msg.as_bytes());
    SquallError::Ws(WsError::HandshakeFailed(msg))
}

impl WsUpgrader {
    pub fn new() -> Self {
        Self::default()
    }

    fn select_subprotocol(&self, req: &Request) -> Option<String> {
        if self.subprotocols.is_empty() {
            return None;
        }
        let offered = req.headers.get("Sec-WebSocket-Protocol")?;
        for server_proto in &self.subprotocols {
            for client_proto in offered.split(',') {
                if client_proto.trim().eq_ignore_ascii_case(server_proto) {
                    return Some(client_proto.trim().to_string());
                }
            }
        }
        None
    }

    fn client_offers_deflate(req: &Request) -> bool {
        req.headers
            .get_all("Sec-WebSocket-Extensions")
            .any(|v| {
                v.split(',').any(|ext| {
                    ext.split(';')
                        .next()
                        .map(|name| name.trim().eq_ignore_ascii_case("permessage-deflate"))
                        .unwrap_or(false)
                })
            })
    }

    /// Validate the handshake and switch the connection to WebSocket
    /// framing. On success the 101 response is queued on `res` and the
    /// returned connection is live once that response flushes.
    pub fn upgrade(&self, res: &mut Response, req: &Request) -> SquallResult<Arc<WsConn>> {
        if !req.headers.contains_token("Connection", "upgrade") {
            return Err(fail(res, 400, "'upgrade' token not found in Connection header"));
        }
        if !req.headers.contains_token("Upgrade", "websocket") {
            return Err(fail(res, 400, "'websocket' token not found in Upgrade header"));
        }
        if req.method != "GET" {
            return Err(fail(res, 405, "websocket upgrade requires GET"));
        }
        if !req.headers.contains_token("Sec-WebSocket-Version", "13") {
            return Err(fail(res, 400, "unsupported websocket version"));
        }
        let origin_ok = match &self.check_origin {
            Some(check) => check(req),
            None => check_same_origin(req),
        };
        if !origin_ok {
            return Err(fail(res, 403, "origin not allowed"));
        }
        let key = match req.headers.get("Sec-WebSocket-Key") {
            Some(k) if !k.trim().is_empty() => k.trim().to_string(),
            _ => return Err(fail(res, 400, "missing Sec-WebSocket-Key")),
        };

        let subprotocol = self.select_subprotocol(req);
        let compress = self.enable_compression && Self::client_offers_deflate(req);

        let conn = res.hijack()?;
        if let Some(timeout) = self.handshake_timeout {
            conn.set_write_deadline(Some(timeout));
        }
        let ws = WsConn::server(conn, subprotocol.clone());

        res.write_header(101);
        res.header_mut().add("Upgrade", "websocket");
        res.header_mut().add("Connection", "Upgrade");
        res.header_mut().add("Sec-WebSocket-Accept", accept_key(&key));
        if let Some(proto) = &subprotocol {
            res.header_mut().add("Sec-WebSocket-Protocol", proto.clone());
        }
        if compress {
            res.header_mut().add(
                "Sec-WebSocket-Extensions",
                "permessage-deflate; server_no_context_takeover; client_no_context_takeover",
            );
        }
        res.set_upgrader(Box::new(WsSession::new(ws.clone())));

        Ok(ws)
    }
}

// ---- Inbound frame engine ----

/// Per-connection deframer state, installed as the parser's pass-through
/// handler after a successful upgrade.
pub(crate) struct WsSession {
    ws: Arc<WsConn>,
    buffer: Vec<u8>,
    message: Vec<u8>,
    opcode: Option<MessageKind>,
    handshake_done: bool,
}

impl WsSession {
    pub(crate) fn new(ws: Arc<WsConn>) -> Self {
        Self {
            ws,
            buffer: Vec::new(),
            message: Vec::new(),
            opcode: None,
            handshake_done: false,
        }
    }

    fn append_message(&mut self, start: usize, end: usize) -> SquallResult<()> {
        let plen = end - start;
        let limit = self.ws.read_limit();
        if limit > 0 && self.message.len() + plen > limit {
            return Err(SquallError::Ws(WsError::MessageTooLarge));
        }
        let old = self.message.len();
        let msg = std::mem::take(&mut self.message);
        let mut msg = if old == 0 && msg.capacity() == 0 {
            pool::malloc(plen)
        } else {
            pool::realloc(msg, old + plen)
        };
        msg[old..].copy_from_slice(&self.buffer[start..end]);
        self.message = msg;
        Ok(())
    }

    fn handle_frame(&mut self, fin: bool, opcode: u8, start: usize, end: usize) -> SquallResult<()> {
        match opcode {
            0x0 | 0x1 | 0x2 => {
                if opcode != 0x0 {
                    let kind = if opcode == 0x1 {
                        MessageKind::Text
                    } else {
                        MessageKind::Binary
                    };
                    match self.opcode {
                        None => self.opcode = Some(kind),
                        // A sender may repeat the opcode on every fragment.
                        Some(current) if current == kind => {}
                        Some(_) => return Err(SquallError::Ws(WsError::InvalidFragment)),
                    }
                } else if self.opcode.is_none() {
                    return Err(SquallError::Ws(WsError::InvalidFragment));
                }

                if end > start {
                    self.append_message(start, end)?;
                }

                if fin {
                    let kind = self.opcode.take().unwrap_or(MessageKind::Binary);
                    let msg = std::mem::take(&mut self.message);
                    if kind == MessageKind::Text && std::str::from_utf8(&msg).is_err() {
                        pool::free(msg);
                        return Err(SquallError::Ws(WsError::InvalidUtf8));
                    }
                    self.ws.dispatch_message(kind, &msg);
                    pool::free(msg);
                }
                Ok(())
            }
            0x8 => {
                let payload = &self.buffer[start..end];
                let (code, reason) = if payload.len() >= 2 {
                    let code = u16::from_be_bytes([payload[0], payload[1]]);
                    let reason = std::str::from_utf8(&payload[2..])
                        .map_err(|_| SquallError::Ws(WsError::InvalidUtf8))?;
                    (code, reason)
                } else {
                    (1000, "")
                };
                self.ws.dispatch_close(code, reason);
                Ok(())
            }
            0x9 => {
                self.ws.dispatch_ping(&self.buffer[start..end]);
                Ok(())
            }
            0xA => {
                self.ws.dispatch_pong(&self.buffer[start..end]);
                Ok(())
            }
            other => Err(SquallError::Ws(WsError::InvalidOpcode(other))),
        }
    }

    fn consume(&mut self, data: &[u8]) -> SquallResult<()> {
        if self.buffer.capacity() == 0 {
            self.buffer = pool::malloc(data.len());
            self.buffer.copy_from_slice(data);
        } else {
            let old = self.buffer.len();
            let buf = std::mem::take(&mut self.buffer);
            let mut buf = pool::realloc(buf, old + data.len());
            buf[old..].copy_from_slice(data);
            self.buffer = buf;
        }

        let mut off = 0;
        while off < self.buffer.len() {
            match next_frame(&mut self.buffer[off..]).map_err(SquallError::Ws)? {
                None => break,
                Some((fin, opcode, header_len, payload_len)) => {
                    let start = off + header_len;
                    let end = start + payload_len;
                    self.handle_frame(fin, opcode, start, end)?;
                    off = end;
                }
            }
        }

        if off > 0 {
            let len = self.buffer.len();
            let old = std::mem::take(&mut self.buffer);
            if off < len {
                let mut rest = pool::malloc(len - off);
                rest.copy_from_slice(&old[off..]);
                self.buffer = rest;
            }
            pool::free(old);
        }
        Ok(())
    }
}

impl Upgrader for WsSession {
    fn read(&mut self, data: &[u8]) -> SquallResult<()> {
        if !self.handshake_done {
            // First bytes after the 101: the handshake deadline no longer
            // applies.
            self.ws.conn().set_write_deadline(None);
            self.ws.conn().set_read_deadline(None);
            self.handshake_done = true;
        }
        let result = self.consume(data);
        if let Err(SquallError::Ws(e)) = &result {
            let code = match e {
                WsError::InvalidUtf8 => 1007,
                WsError::MessageTooLarge => 1009,
                _ => 1002,
            };
            let _ = self.ws.send_close(code, "");
        }
        result
    }
}

/// Parse one frame from the head of `buf`, unmasking the payload in
/// place. Returns `(fin, opcode, header_len, payload_len)`, or `None`
/// when the buffer does not yet hold a complete frame.
fn next_frame(buf: &mut [u8]) -> Result<Option<(bool, u8, usize, usize)>, WsError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let b0 = buf[0];
    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        return Err(WsError::NonZeroRsv);
    }
    let opcode = b0 & 0x0F;
    if !matches!(opcode, 0x0 | 0x1 | 0x2 | 0x8 | 0x9 | 0xA) {
        return Err(WsError::InvalidOpcode(opcode));
    }

    let masked = buf[1] & 0x80 != 0;
    let len7 = (buf[1] & 0x7F) as usize;
    let (mut header_len, payload_len): (usize, usize) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (4, u16::from_be_bytes([buf[2], buf[3]]) as usize)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut ext = [0u8; 8];
            ext.copy_from_slice(&buf[2..10]);
            let v = u64::from_be_bytes(ext);
            if v > usize::MAX as u64 {
                return Err(WsError::MessageTooLarge);
            }
            (10, v as usize)
        }
        n => (2, n),
    };
    if masked {
        header_len += 4;
    }

    if opcode >= 0x8 {
        if !fin || payload_len > 125 {
            return Err(WsError::InvalidControlFrame);
        }
    }

    let total = header_len
        .checked_add(payload_len)
        .ok_or(WsError::MessageTooLarge)?;
    if buf.len() < total {
        return Ok(None);
    }

    if masked {
        let mask = [
            buf[header_len - 4],
            buf[header_len - 3],
            buf[header_len - 2],
            buf[header_len - 1],
        ];
        for j in 0..payload_len {
            buf[header_len + j] ^= mask[j % 4];
        }
    }

    Ok(Some((fin, opcode, header_len, payload_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked_frame(fin: bool, opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
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
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        frame
    }

    #[test]
    fn test_next_frame_unmasks_in_place() {
        let mut frame = masked_frame(true, 0x1, b"hello world", [0x37, 0xfa, 0x21, 0x3d]);
        let parsed = next_frame(&mut frame).expect("parse").expect("complete");
        let (fin, opcode, hlen, plen) = parsed;
        assert!(fin);
        assert_eq!(opcode, 0x1);
        assert_eq!(&frame[hlen..hlen + plen], b"hello world");
    }

    #[test]
    fn test_next_frame_incomplete() {
        let frame = masked_frame(true, 0x2, &[9u8; 300], [1, 2, 3, 4]);
        for cut in [1usize, 2, 3, 7, 100] {
            let mut partial = frame[..cut].to_vec();
            assert_eq!(next_frame(&mut partial).expect("parse"), None);
        }
    }

    #[test]
    fn test_next_frame_extended_lengths() {
        let mut frame = masked_frame(true, 0x2, &[7u8; 300], [1, 2, 3, 4]);
        let (_, _, hlen, plen) = next_frame(&mut frame).expect("parse").expect("complete");
        assert_eq!(plen, 300);
        assert_eq!(hlen, 2 + 2 + 4);

        let big = vec![3u8; 70_000];
        let mut frame = masked_frame(true, 0x2, &big, [5, 6, 7, 8]);
        let (_, _, hlen, plen) = next_frame(&mut frame).expect("parse").expect("complete");
        assert_eq!(plen, 70_000);
        assert_eq!(hlen, 2 + 8 + 4);
    }

    #[test]
    fn test_fragmented_control_frame_rejected() {
        let mut frame = masked_frame(false, 0x9, b"x", [0, 0, 0, 0]);
        assert_eq!(next_frame(&mut frame), Err(WsError::InvalidControlFrame));
    }

    #[test]
    fn test_oversized_control_frame_rejected() {
        let mut frame = masked_frame(true, 0x8, &[0u8; 126], [0, 0, 0, 0]);
        assert_eq!(next_frame(&mut frame), Err(WsError::InvalidControlFrame));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut frame = masked_frame(true, 0x3, b"", [0, 0, 0, 0]);
        assert_eq!(next_frame(&mut frame), Err(WsError::InvalidOpcode(3)));
    }

    #[test]
    fn test_rsv_bits_rejected() {
        let mut frame = masked_frame(true, 0x1, b"", [0, 0, 0, 0]);
        frame[0] |= 0x40;
        assert_eq!(next_frame(&mut frame), Err(WsError::NonZeroRsv));
    }

    #[test]
    fn test_origin_host() {
        assert_eq!(origin_host("http://example.com"), "example.com");
        assert_eq!(origin_host("https://example.com/page"), "example.com");
        assert_eq!(origin_host("example.com:8080"), "example.com:8080");
    }
}

//! WebSocket connection surface: handler registration and the outbound
//! frame serializer.

use super::{WsError, FRAME_PAYLOAD_SIZE, MAX_CONTROL_FRAME_PAYLOAD_SIZE};
use crate::conn::Conn;
use crate::error::{SquallError, SquallResult};
use crate::pool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Message types per RFC 6455 section 11.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl MessageKind {
    pub fn opcode(self) -> u8 {
        match self {
            MessageKind::Text => 0x1,
            MessageKind::Binary => 0x2,
            MessageKind::Close => 0x8,
            MessageKind::Ping => 0x9,
            MessageKind::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(
            self,
            MessageKind::Close | MessageKind::Ping | MessageKind::Pong
        )
    }
}

type MessageHandler = Arc<dyn Fn(&Arc<WsConn>, MessageKind, &[u8]) + Send + Sync>;
type ControlHandler = Arc<dyn Fn(&Arc<WsConn>, &[u8]) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(&Arc<WsConn>, u16, &str) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    message: Option<MessageHandler>,
    ping: Option<ControlHandler>,
    pong: Option<ControlHandler>,
    close: Option<CloseHandler>,
}

/// A connection that completed the WebSocket handshake. Server frames go
/// out unmasked; client connections mask every frame with a fresh random
/// key.
pub struct WsConn {
    conn: Arc<Conn>,
    client: bool,
    subprotocol: Option<String>,
    read_limit: AtomicUsize,
    closing: AtomicBool,
    write_mux: Mutex<()>,
    handlers: Mutex<Handlers>,
}

impl WsConn {
    pub(crate) fn server(conn: Arc<Conn>, subprotocol: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            client: false,
            subprotocol,
            read_limit: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            write_mux: Mutex::new(()),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    /// Client-side wrapper around an attached connection; outbound frames
    /// are masked as RFC 6455 requires.
    pub fn client(conn: Arc<Conn>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            client: true,
            subprotocol: None,
            read_limit: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            write_mux: Mutex::new(()),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Bound on an assembled message; 0 means unlimited.
    pub fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }

    pub(crate) fn read_limit(&self) -> usize {
        self.read_limit.load(Ordering::Relaxed)
    }

    pub fn set_message_handler<F>(&self, f: F)
    where
        F: Fn(&Arc<WsConn>, MessageKind, &[u8]) + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).message = Some(Arc::new(f));
    }

    pub fn set_ping_handler<F>(&self, f: F)
    where
        F: Fn(&Arc<WsConn>, &[u8]) + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).ping = Some(Arc::new(f));
    }

    pub fn set_pong_handler<F>(&self, f: F)
    where
        F: Fn(&Arc<WsConn>, &[u8]) + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).pong = Some(Arc::new(f));
    }

    pub fn set_close_handler<F>(&self, f: F)
    where
        F: Fn(&Arc<WsConn>, u16, &str) + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).close = Some(Arc::new(f));
    }

    /// Send one message, fragmented into bounded frames: opcode on the
    /// first frame, continuation on the rest, FIN only on the last. The
    /// frames of one message are contiguous on the wire.
    pub fn write_message(self: &Arc<Self>, kind: MessageKind, data: &[u8]) -> SquallResult<()> {
        if kind.is_control() && data.len() > MAX_CONTROL_FRAME_PAYLOAD_SIZE {
            return Err(SquallError::Ws(WsError::InvalidControlFrame));
        }
        let _guard = self.write_mux.lock().unwrap_or_else(|e| e.into_inner());
        if data.is_empty() {
            return self.write_frame(kind.opcode(), true, &[]);
        }
        let mut off = 0;
        let mut first = true;
        while off < data.len() {
            let n = (data.len() - off).min(FRAME_PAYLOAD_SIZE);
            let fin = off + n == data.len();
            let opcode = if first { kind.opcode() } else { 0x0 };
            self.write_frame(opcode, fin, &data[off..off + n])?;
            off += n;
            first = false;
        }
        Ok(())
    }

    /// Close frame with status code and reason, bounded to the control
    /// payload limit.
    pub fn send_close(self: &Arc<Self>, code: u16, reason: &str) -> SquallResult<()> {
        if reason.len() + 2 > MAX_CONTROL_FRAME_PAYLOAD_SIZE {
            return Err(SquallError::Ws(WsError::InvalidControlFrame));
        }
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        self.write_message(MessageKind::Close, &payload)
    }

    fn write_frame(&self, opcode: u8, fin: bool, payload: &[u8]) -> SquallResult<()> {
        let plen = payload.len();
        let head = if plen < 126 {
            2
        } else if plen < 65536 {
            4
        } else {
            10
        };
        let mask_len = if self.client { 4 } else { 0 };
        let mut buf = pool::malloc(head + mask_len + plen);

        buf[0] = opcode | if fin { 0x80 } else { 0 };
        if plen < 126 {
            buf[1] = plen as u8;
        } else if plen < 65536 {
            buf[1] = 126;
            buf[2..4].copy_from_slice(&(plen as u16).to_be_bytes());
        } else {
            buf[1] = 127;
            buf[2..10].copy_from_slice(&(plen as u64).to_be_bytes());
        }

        let mut off = head;
        if self.client {
            buf[1] |= 0x80;
            let mask: [u8; 4] = rand::random();
            buf[off..off + 4].copy_from_slice(&mask);
            off += 4;
            for (i, b) in payload.iter().enumerate() {
                buf[off + i] = b ^ mask[i % 4];
            }
        } else {
            buf[off..off + plen].copy_from_slice(payload);
        }

        let res = self.conn.write(&buf);
        pool::free(buf);
        res.map(|_| ())
    }

    // ---- Inbound dispatch (called by the deframer) ----

    pub(crate) fn dispatch_message(self: &Arc<Self>, kind: MessageKind, payload: &[u8]) {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .message
            .clone();
        match handler {
            Some(h) => h(self, kind, payload),
            None => debug!(
                "websocket message on fd {}: {:?}, {} bytes",
                self.conn.fd(),
                kind,
                payload.len()
            ),
        }
    }

    pub(crate) fn dispatch_ping(self: &Arc<Self>, payload: &[u8]) {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ping
            .clone();
        match handler {
            Some(h) => h(self, payload),
            None => {
                let _ = self.write_message(MessageKind::Pong, payload);
            }
        }
    }

    pub(crate) fn dispatch_pong(self: &Arc<Self>, payload: &[u8]) {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pong
            .clone();
        if let Some(h) = handler {
            h(self, payload);
        }
    }

    /// Peer close: run the handler (default echoes the close frame), then
    /// tear the connection down. Runs at most once.
    pub(crate) fn dispatch_close(self: &Arc<Self>, code: u16, reason: &str) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .close
            .clone();
        match handler {
            Some(h) => h(self, code, reason),
            None => {
                let _ = self.send_close(code, reason);
            }
        }
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes() {
        assert_eq!(MessageKind::Text.opcode(), 1);
        assert_eq!(MessageKind::Binary.opcode(), 2);
        assert_eq!(MessageKind::Close.opcode(), 8);
        assert_eq!(MessageKind::Ping.opcode(), 9);
        assert_eq!(MessageKind::Pong.opcode(), 10);
        assert!(MessageKind::Close.is_control());
        assert!(!MessageKind::Binary.is_control());
    }
}

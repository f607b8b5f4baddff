//! A single accepted or attached TCP stream.
//!
//! All read-side I/O for a connection is serialized on its owning poller
//! thread. The write side may be entered from any thread (handlers,
//! executors) and is guarded by the write mutex; writes that cannot
//! complete synchronously enqueue their residue and register write
//! interest with the owning poller, which drains the queue on writable
//! readiness.

use crate::engine::EngineInner;
use crate::error::{SquallError, SquallResult};
use crate::poller::Poller;
use crate::pool;
use crate::sys;
use crate::transport::Transport;
use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(target_os = "linux")]
const MAX_SENDFILE_SIZE: usize = 4 << 20;

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct Outbound {
    data: Vec<u8>,
    pos: usize,
}

struct WriteState {
    closed: bool,
    queue: VecDeque<Outbound>,
    queued_bytes: usize,
    write_interest: bool,
}

pub struct Conn {
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    pub(crate) engine: Weak<EngineInner>,
    pub(crate) poller: OnceLock<Arc<Poller>>,
    weak_self: Weak<Conn>,

    write: Mutex<WriteState>,
    wait_write: Condvar,
    closed: AtomicBool,

    read_deadline: AtomicI64,
    write_deadline: AtomicI64,

    session: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    transport: Mutex<Option<Box<dyn Transport + Send>>>,
}

impl Conn {
    pub(crate) fn new(
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        engine: Weak<EngineInner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            fd,
            local_addr,
            peer_addr,
            engine,
            poller: OnceLock::new(),
            weak_self: weak.clone(),
            write: Mutex::new(WriteState {
                closed: false,
                queue: VecDeque::new(),
                queued_bytes: 0,
                write_interest: false,
            }),
            wait_write: Condvar::new(),
            closed: AtomicBool::new(false),
            read_deadline: AtomicI64::new(0),
            write_deadline: AtomicI64::new(0),
            session: Mutex::new(None),
            transport: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Opaque slot for the protocol layer bound to this connection.
    pub fn set_session(&self, session: Arc<dyn Any + Send + Sync>) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
    }

    pub fn session(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Install a byte transformer (e.g. a TLS session) between the socket
    /// and the protocol layer.
    pub fn set_transport(&self, transport: Box<dyn Transport + Send>) {
        *self.transport.lock().unwrap_or_else(|e| e.into_inner()) = Some(transport);
    }

    pub fn set_read_deadline(&self, timeout: Option<Duration>) {
        let at = timeout.map(|t| now_millis() + t.as_millis() as i64).unwrap_or(0);
        self.read_deadline.store(at, Ordering::Relaxed);
    }

    pub fn set_write_deadline(&self, timeout: Option<Duration>) {
        let at = timeout.map(|t| now_millis() + t.as_millis() as i64).unwrap_or(0);
        self.write_deadline.store(at, Ordering::Relaxed);
    }

    pub(crate) fn read_deadline_expired(&self, now_ms: i64) -> bool {
        let at = self.read_deadline.load(Ordering::Relaxed);
        at != 0 && now_ms >= at
    }

    /// One nonblocking read into `buf`. Returns `Ok(0)` when the socket has
    /// nothing pending; EOF and hard errors are terminal.
    pub(crate) fn read(&self, buf: &mut [u8]) -> SquallResult<usize> {
        if self.is_closed() {
            return Err(SquallError::Closed);
        }
        if self.read_deadline_expired(now_millis()) {
            return Err(SquallError::TimedOut);
        }
        loop {
            match sys::read(self.fd, buf) {
                Ok(0) => {
                    return Err(SquallError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed",
                    )))
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(SquallError::Io(e)),
            }
        }
    }

    /// Run inbound bytes through the installed transport, if any.
    pub(crate) fn transform_inbound(&self, raw: &[u8]) -> SquallResult<Option<Vec<u8>>> {
        let mut guard = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(t) => t.unwrap_inbound(raw).map(Some),
            None => Ok(None),
        }
    }

    /// Queueing write. Synchronous when the queue is empty and the socket
    /// is writable; any residue is enqueued and flushed on writable
    /// readiness. Returns the number of caller bytes accepted.
    pub fn write(&self, data: &[u8]) -> SquallResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let wd = self.write_deadline.load(Ordering::Relaxed);
        if wd != 0 && now_millis() >= wd {
            self.close_with_err(SquallError::TimedOut);
            return Err(SquallError::TimedOut);
        }

        let wrapped;
        let payload: &[u8] = {
            let mut guard = self.transport.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_mut() {
                Some(t) => {
                    wrapped = t.wrap_outbound(data)?;
                    &wrapped
                }
                None => data,
            }
        };

        if payload.is_empty() {
            // The transport buffered everything (e.g. a partial record).
            return Ok(data.len());
        }

        let mut st = self.write.lock().unwrap_or_else(|e| e.into_inner());
        if st.closed {
            return Err(SquallError::Closed);
        }

        let mut off = 0;
        if st.queue.is_empty() {
            loop {
                match sys::write(self.fd, &payload[off..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        off += n;
                        if off == payload.len() {
                            return Ok(data.len());
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        let kind = e.kind();
                        self.terminate(st, SquallError::Io(e));
                        return Err(SquallError::Io(io::Error::from(kind)));
                    }
                }
            }
        }

        let residue = &payload[off..];
        if let Some(engine) = self.engine.upgrade() {
            let limit = engine.max_write_buffer_size;
            if limit > 0 && st.queued_bytes + residue.len() > limit {
                self.terminate(st, SquallError::WriteBufferOverflow);
                return Err(SquallError::WriteBufferOverflow);
            }
        }
        let mut buf = pool::malloc(residue.len());
        buf.copy_from_slice(residue);
        st.queued_bytes += buf.len();
        st.queue.push_back(Outbound { data: buf, pos: 0 });
        if !st.write_interest {
            st.write_interest = true;
            if let Some(p) = self.poller.get() {
                p.set_write_interest(self.fd, true);
            }
        }
        Ok(data.len())
    }

    /// Drain the write queue on writable readiness. Called from the owning
    /// poller thread.
    pub(crate) fn flush(&self) {
        let mut st = self.write.lock().unwrap_or_else(|e| e.into_inner());
        if st.closed {
            return;
        }
        while !st.queue.is_empty() {
            let (res, batch_len) = {
                let mut slices: [&[u8]; 8] = [&[]; 8];
                let mut cnt = 0;
                let mut total = 0;
                for o in st.queue.iter().take(8) {
                    slices[cnt] = &o.data[o.pos..];
                    total += slices[cnt].len();
                    cnt += 1;
                }
                (sys::writev(self.fd, &slices[..cnt]), total)
            };
            let wrote = match res {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.terminate(st, SquallError::Io(e));
                    return;
                }
            };
            if wrote == 0 {
                return;
            }
            let mut remaining = wrote;
            while remaining > 0 {
                let fully_written = {
                    let front = match st.queue.front_mut() {
                        Some(f) => f,
                        None => break,
                    };
                    let avail = front.data.len() - front.pos;
                    if remaining >= avail {
                        remaining -= avail;
                        true
                    } else {
                        front.pos += remaining;
                        remaining = 0;
                        false
                    }
                };
                if fully_written {
                    if let Some(o) = st.queue.pop_front() {
                        st.queued_bytes -= o.data.len();
                        pool::free(o.data);
                    }
                }
            }
            if wrote < batch_len {
                // Kernel buffer is full again; keep write interest.
                return;
            }
        }
        if st.write_interest {
            st.write_interest = false;
            if let Some(p) = self.poller.get() {
                p.set_write_interest(self.fd, false);
            }
        }
        self.wait_write.notify_all();
    }

    /// Zero-copy file transfer, serialized with queued writes through the
    /// writer-wait gate. Suspends on EAGAIN until writable readiness.
    #[cfg(target_os = "linux")]
    pub fn sendfile(&self, file: &std::fs::File, remain: i64) -> SquallResult<i64> {
        use std::os::unix::io::AsRawFd;

        let mut remain = remain;
        if remain <= 0 {
            remain = file.metadata().map_err(SquallError::Io)?.len() as i64;
        }
        let total = remain;
        let src = file.as_raw_fd();

        let mut st = self.write.lock().unwrap_or_else(|e| e.into_inner());
        if st.closed {
            return Err(SquallError::Closed);
        }
        while !st.queue.is_empty() && !st.closed {
            st = self.wait_write.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        if st.closed {
            return Err(SquallError::Closed);
        }

        while remain > 0 {
            let n = (remain as usize).min(MAX_SENDFILE_SIZE);
            match sys::sendfile(self.fd, src, n) {
                Ok(0) => break,
                Ok(sent) => remain -= sent as i64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !st.write_interest {
                        st.write_interest = true;
                        if let Some(p) = self.poller.get() {
                            p.set_write_interest(self.fd, true);
                        }
                    }
                    st = self.wait_write.wait(st).unwrap_or_else(|e| e.into_inner());
                    if st.closed {
                        return Err(SquallError::Closed);
                    }
                }
                Err(e) => {
                    let kind = e.kind();
                    self.terminate(st, SquallError::Io(e));
                    return Err(SquallError::Io(io::Error::from(kind)));
                }
            }
        }
        drop(st);
        Ok(total - remain)
    }

    pub fn close(&self) {
        self.close_with_err(SquallError::Closed);
    }

    /// Idempotent close. Clears the table slot before handing the fd back
    /// to the OS, releases queued buffers, and fires on_close exactly once.
    pub fn close_with_err(&self, err: SquallError) {
        let st = self.write.lock().unwrap_or_else(|e| e.into_inner());
        self.terminate(st, err);
    }

    fn terminate(&self, mut st: MutexGuard<'_, WriteState>, err: SquallError) {
        if st.closed {
            return;
        }
        st.closed = true;
        let queued: Vec<Outbound> = st.queue.drain(..).collect();
        st.queued_bytes = 0;
        drop(st);

        self.closed.store(true, Ordering::Release);
        for o in queued {
            pool::free(o.data);
        }

        let engine = self.engine.upgrade();
        if let Some(engine) = &engine {
            engine.table.remove(self.fd);
        }
        if let Some(p) = self.poller.get() {
            p.poll_delete(self.fd);
            p.decrease();
        }
        sys::close(self.fd);
        self.wait_write.notify_all();

        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if let Some(engine) = engine {
            engine.decrease();
            if let Some(conn) = self.weak_self.upgrade() {
                engine.fire_close(&conn, &err);
            }
        }
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        // A connection that was never closed (e.g. admission raced) still
        // must not leak its fd.
        if !self.closed.load(Ordering::Acquire) {
            sys::close(self.fd);
        }
    }
}

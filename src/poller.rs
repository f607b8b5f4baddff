//! Event-loop workers.
//!
//! A poller is either a listener (waits for accept readiness on the listen
//! fds) or a connection worker (waits on its subset of connection fds plus
//! a wakeup pipe). A connection fd belongs to exactly one worker, chosen as
//! `fd % n_poller`, so any thread can locate the owner without a lookup.
//! All read-side I/O, parser advancement, and flushes for a connection are
//! serialized on its owner's thread.

use crate::conn::{now_millis, Conn};
use crate::engine::EngineInner;
use crate::error::{SquallError, SquallResult};
use crate::sys;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

const WAKE_TOKEN: u64 = u64::MAX;
const EVENT_BATCH: usize = 1024;
const WAIT_TIMEOUT_MS: i32 = 1000;

pub(crate) struct Poller {
    pub(crate) index: usize,
    is_listener: bool,
    poll: sys::Poll,
    engine: Weak<EngineInner>,
    shutdown: AtomicBool,
    curr_load: AtomicI64,
    wake_r: RawFd,
    wake_w: RawFd,
}

impl Poller {
    pub(crate) fn new(
        engine: Weak<EngineInner>,
        is_listener: bool,
        index: usize,
    ) -> SquallResult<Arc<Self>> {
        let poll = sys::Poll::new().map_err(SquallError::Io)?;
        let (wake_r, wake_w) = sys::create_pipe().map_err(SquallError::Io)?;
        poll.add(wake_r, WAKE_TOKEN, sys::POLL_IN)
            .map_err(SquallError::Io)?;

        if is_listener {
            if let Some(e) = engine.upgrade() {
                let lfds = e.listen_fds();
                for lfd in lfds {
                    poll.add(lfd, lfd as u64, sys::POLL_IN)
                        .map_err(SquallError::Io)?;
                }
            }
        }

        Ok(Arc::new(Self {
            index,
            is_listener,
            poll,
            engine,
            shutdown: AtomicBool::new(false),
            curr_load: AtomicI64::new(0),
            wake_r,
            wake_w,
        }))
    }

    fn increase(&self) {
        self.curr_load.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrease(&self) {
        self.curr_load.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn trigger(&self) {
        let _ = sys::write(self.wake_w, &[1]);
    }

    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.trigger();
    }

    pub(crate) fn poll_delete(&self, fd: RawFd) {
        let _ = self.poll.delete(fd);
    }

    /// Toggle write-readiness interest for a registered fd.
    pub(crate) fn set_write_interest(&self, fd: RawFd, on: bool) {
        let interests = if on {
            sys::POLL_IN | sys::POLL_OUT
        } else {
            sys::POLL_IN
        };
        if let Err(e) = self.poll.modify(fd, fd as u64, interests) {
            if e.raw_os_error() == Some(libc::ENOENT) {
                let _ = self.poll.add(fd, fd as u64, interests);
            }
        }
    }

    /// Bind a connection to this worker: fire on_open, publish the table
    /// slot, register read interest.
    pub(crate) fn add_conn(self: &Arc<Self>, conn: Arc<Conn>) -> SquallResult<()> {
        let _ = conn.poller.set(self.clone());
        self.increase();
        if let Some(engine) = self.engine.upgrade() {
            engine.fire_open(&conn);
            engine.table.store(conn.fd(), conn.clone());
        }
        if let Err(e) = self.poll.add(conn.fd(), conn.fd() as u64, sys::POLL_IN) {
            let kind = e.kind();
            conn.close_with_err(SquallError::Io(e));
            return Err(SquallError::Io(io::Error::from(kind)));
        }
        Ok(())
    }

    pub(crate) fn run(self: &Arc<Self>) {
        let engine = match self.engine.upgrade() {
            Some(e) => e,
            None => return,
        };
        let kind = if self.is_listener { "listener" } else { "poller" };
        debug!("{}[{}] start", kind, self.index);

        let mut events = vec![sys::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];
        let mut scratch = vec![0u8; engine.read_buffer_size];
        let mut last_sweep = now_millis();

        while !self.shutdown.load(Ordering::Acquire) {
            let n = match self.poll.wait(&mut events, WAIT_TIMEOUT_MS) {
                Ok(n) => n,
                Err(e) => {
                    error!("{}[{}] wait failed: {}", kind, self.index, e);
                    break;
                }
            };

            for ev in events.iter().take(n) {
                let token = ev.u64;
                if token == WAKE_TOKEN {
                    sys::drain_pipe(self.wake_r);
                    continue;
                }
                let fd = token as RawFd;
                if self.is_listener {
                    self.accept_loop(&engine, fd);
                } else {
                    self.handle_event(&engine, fd, ev.events as i32, &mut scratch);
                }
            }

            if !self.is_listener {
                let now = now_millis();
                if now - last_sweep >= 1000 {
                    self.sweep_deadlines(&engine, now);
                    last_sweep = now;
                }
            }
        }

        debug!(
            "{}[{}] stopped, {} connections still bound",
            kind,
            self.index,
            self.curr_load.load(Ordering::Relaxed)
        );
    }

    fn accept_loop(&self, engine: &Arc<EngineInner>, lfd: RawFd) {
        loop {
            match sys::accept(lfd) {
                Ok(Some((fd, peer))) => {
                    if !engine.acceptable(fd) {
                        sys::close(fd);
                        continue;
                    }
                    let local = match sys::local_addr(fd) {
                        Ok(a) => a,
                        Err(e) => {
                            warn!("getsockname failed for fd {}: {}", fd, e);
                            engine.decrease();
                            sys::close(fd);
                            continue;
                        }
                    };
                    let conn = Conn::new(fd, local, peer, Arc::downgrade(engine));
                    match engine.poller_for(fd) {
                        Some(owner) => {
                            if let Err(e) = owner.add_conn(conn) {
                                warn!("register fd {} failed: {}", fd, e);
                            }
                        }
                        None => {
                            engine.decrease();
                            sys::close(fd);
                        }
                    }
                }
                Ok(None) => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept on fd {} failed: {}", lfd, e);
                    return;
                }
            }
        }
    }

    fn handle_event(&self, engine: &Arc<EngineInner>, fd: RawFd, flags: i32, scratch: &mut [u8]) {
        let conn = match engine.table.get(fd) {
            Some(c) => c,
            None => return,
        };

        if flags & (sys::POLL_ERR | sys::POLL_HUP) != 0 {
            conn.close_with_err(SquallError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "hangup",
            )));
            return;
        }

        if flags & sys::POLL_IN != 0 {
            if let Some(hook) = engine.hooks.on_read.as_ref() {
                match hook(&conn, scratch) {
                    Ok(data) => {
                        if !data.is_empty() {
                            engine.fire_data(&conn, &data);
                        }
                    }
                    Err(e) => {
                        conn.close_with_err(e);
                        return;
                    }
                }
            } else {
                match conn.read(scratch) {
                    Ok(0) => {}
                    Ok(n) => match conn.transform_inbound(&scratch[..n]) {
                        Ok(Some(decoded)) => {
                            if !decoded.is_empty() {
                                engine.fire_data(&conn, &decoded);
                            }
                        }
                        Ok(None) => engine.fire_data(&conn, &scratch[..n]),
                        Err(e) => {
                            conn.close_with_err(e);
                            return;
                        }
                    },
                    Err(e) => {
                        conn.close_with_err(e);
                        return;
                    }
                }
            }
        }

        if flags & sys::POLL_OUT != 0 {
            conn.flush();
        }
    }

    fn sweep_deadlines(&self, engine: &Arc<EngineInner>, now: i64) {
        for conn in engine.table.snapshot() {
            if (conn.fd() as usize) % engine.n_poller == self.index
                && conn.read_deadline_expired(now)
            {
                conn.close_with_err(SquallError::TimedOut);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        sys::close(self.wake_r);
        sys::close(self.wake_w);
    }
}

//! Engine: process-wide owner of listeners, pollers, and the connection
//! table, with admission control and lifecycle hooks.

use crate::conn::Conn;
use crate::error::{SquallError, SquallResult};
use crate::poller::Poller;
use crate::sys;
use crate::table::ConnTable;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_MAX_LOAD: usize = 1024 * 1024;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(120);

/// Engine configuration. Zero-valued fields are normalized to defaults at
/// construction.
#[derive(Clone)]
pub struct Config {
    /// Address family, currently only "tcp".
    pub network: String,
    /// Listen addresses, e.g. `["127.0.0.1:8080"]`. May be empty for an
    /// engine that only manages attached connections.
    pub addrs: Vec<String>,
    /// Upper bound on concurrent connections (default 1 Mi).
    pub max_load: usize,
    /// Listener pollers (default 1 when `addrs` is non-empty).
    pub n_listener: usize,
    /// Connection pollers (default: CPU count).
    pub n_poller: usize,
    /// Per-poller scratch read buffer (default 16 KiB).
    pub read_buffer_size: usize,
    /// Per-connection write queue bound in bytes; 0 means unbounded.
    pub max_write_buffer_size: usize,
    /// Keep-alive read deadline applied after each HTTP response.
    pub keepalive: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            addrs: Vec::new(),
            max_load: 0,
            n_listener: 0,
            n_poller: 0,
            read_buffer_size: 0,
            max_write_buffer_size: 0,
            keepalive: Duration::ZERO,
        }
    }
}

type OnOpen = Box<dyn Fn(&Arc<Conn>) + Send + Sync>;
type OnClose = Box<dyn Fn(&Arc<Conn>, &SquallError) + Send + Sync>;
type OnData = Box<dyn Fn(&Arc<Conn>, &[u8]) + Send + Sync>;
type OnRead = Box<dyn Fn(&Arc<Conn>, &mut [u8]) -> SquallResult<Vec<u8>> + Send + Sync>;

pub(crate) struct Hooks {
    pub(crate) on_open: OnOpen,
    pub(crate) on_close: OnClose,
    pub(crate) on_data: OnData,
    pub(crate) on_read: Option<OnRead>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            on_open: Box::new(|_| {}),
            on_close: Box::new(|_, _| {}),
            on_data: Box::new(|_, _| {}),
            on_read: None,
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) network: String,
    pub(crate) addrs: Vec<String>,
    pub(crate) max_load: i64,
    pub(crate) n_listener: usize,
    pub(crate) n_poller: usize,
    pub(crate) read_buffer_size: usize,
    pub(crate) max_write_buffer_size: usize,
    pub(crate) keepalive: Duration,

    pub(crate) table: ConnTable,
    curr_load: AtomicI64,
    refused: AtomicU64,

    lfds: Mutex<Vec<RawFd>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
    listeners: OnceLock<Vec<Arc<Poller>>>,
    pollers: OnceLock<Vec<Arc<Poller>>>,

    pub(crate) hooks: Hooks,
}

impl EngineInner {
    pub(crate) fn listen_fds(&self) -> Vec<RawFd> {
        self.lfds.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Admission check for a freshly accepted fd. Grows the table and
    /// claims a load slot; refusal leaves the counter untouched.
    pub(crate) fn acceptable(&self, fd: RawFd) -> bool {
        if fd < 0 {
            return false;
        }
        self.table.ensure(fd);
        if self.curr_load.fetch_add(1, Ordering::AcqRel) + 1 > self.max_load {
            self.curr_load.fetch_sub(1, Ordering::AcqRel);
            self.refused.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub(crate) fn decrease(&self) {
        self.curr_load.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn poller_for(&self, fd: RawFd) -> Option<Arc<Poller>> {
        self.pollers
            .get()
            .map(|ps| ps[fd as usize % ps.len()].clone())
    }

    pub(crate) fn fire_open(&self, conn: &Arc<Conn>) {
        (self.hooks.on_open)(conn);
    }

    pub(crate) fn fire_close(&self, conn: &Arc<Conn>, err: &SquallError) {
        (self.hooks.on_close)(conn, err);
    }

    pub(crate) fn fire_data(&self, conn: &Arc<Conn>, data: &[u8]) {
        (self.hooks.on_data)(conn, data);
    }
}

/// The reactor: listeners, pollers, and the bounded connection table.
pub struct Engine {
    inner: Arc<EngineInner>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
}

impl Engine {
    /// Build an engine from `config`, normalizing zero-valued fields.
    pub fn new(config: Config) -> Self {
        let max_load = if config.max_load == 0 {
            DEFAULT_MAX_LOAD
        } else {
            config.max_load
        };
        let n_listener = if config.n_listener == 0 && !config.addrs.is_empty() {
            1
        } else {
            config.n_listener
        };
        let n_poller = if config.n_poller == 0 {
            num_cpus::get()
        } else {
            config.n_poller
        };
        let read_buffer_size = if config.read_buffer_size == 0 {
            DEFAULT_READ_BUFFER_SIZE
        } else {
            config.read_buffer_size
        };
        let keepalive = if config.keepalive.is_zero() {
            DEFAULT_KEEPALIVE
        } else {
            config.keepalive
        };

        let inner = Arc::new(EngineInner {
            network: config.network,
            addrs: config.addrs,
            max_load: max_load as i64,
            n_listener,
            n_poller,
            read_buffer_size,
            max_write_buffer_size: config.max_write_buffer_size,
            keepalive,
            table: ConnTable::new(max_load.min(64 * 1024) + 64),
            curr_load: AtomicI64::new(0),
            refused: AtomicU64::new(0),
            lfds: Mutex::new(Vec::new()),
            local_addrs: Mutex::new(Vec::new()),
            listeners: OnceLock::new(),
            pollers: OnceLock::new(),
            hooks: Hooks::default(),
        });

        Self {
            inner,
            threads: Vec::new(),
            started: false,
        }
    }

    fn hooks_mut(&mut self) -> Option<&mut Hooks> {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => Some(&mut inner.hooks),
            None => {
                warn!("hooks must be installed before start");
                None
            }
        }
    }

    /// Called once per accepted or attached connection, before its first
    /// read.
    pub fn on_open<F: Fn(&Arc<Conn>) + Send + Sync + 'static>(&mut self, f: F) {
        if let Some(h) = self.hooks_mut() {
            h.on_open = Box::new(f);
        }
    }

    /// Called exactly once when a connection closes, with its terminal
    /// error.
    pub fn on_close<F: Fn(&Arc<Conn>, &SquallError) + Send + Sync + 'static>(&mut self, f: F) {
        if let Some(h) = self.hooks_mut() {
            h.on_close = Box::new(f);
        }
    }

    /// Called with each batch of inbound payload bytes.
    pub fn on_data<F: Fn(&Arc<Conn>, &[u8]) + Send + Sync + 'static>(&mut self, f: F) {
        if let Some(h) = self.hooks_mut() {
            h.on_data = Box::new(f);
        }
    }

    /// Replace the raw read step for custom transports: the hook performs
    /// the socket read itself (the scratch buffer is on loan from the
    /// poller) and returns the decoded payload, empty when nothing is
    /// pending.
    pub fn on_read<F>(&mut self, f: F)
    where
        F: Fn(&Arc<Conn>, &mut [u8]) -> SquallResult<Vec<u8>> + Send + Sync + 'static,
    {
        if let Some(h) = self.hooks_mut() {
            h.on_read = Some(Box::new(f));
        }
    }

    /// Bind listeners and spawn poller threads.
    pub fn start(&mut self) -> SquallResult<()> {
        if self.started {
            return Ok(());
        }
        if self.inner.network != "tcp" {
            return Err(SquallError::Other(format!(
                "unsupported network {:?}",
                self.inner.network
            )));
        }

        let mut lfds = Vec::new();
        let mut laddrs = Vec::new();
        for addr in &self.inner.addrs {
            let bound = addr
                .to_socket_addrs()
                .map_err(SquallError::Io)
                .and_then(|mut addrs| {
                    addrs
                        .next()
                        .ok_or_else(|| SquallError::Other(format!("cannot resolve {:?}", addr)))
                })
                .and_then(|sockaddr| {
                    sys::create_listen_socket(&sockaddr)
                        .map(|fd| (fd, sockaddr))
                        .map_err(SquallError::Io)
                });
            match bound {
                Ok((fd, sockaddr)) => {
                    laddrs.push(sys::local_addr(fd).unwrap_or(sockaddr));
                    lfds.push(fd);
                }
                Err(e) => {
                    for fd in lfds {
                        sys::close(fd);
                    }
                    return Err(e);
                }
            }
        }
        *self.inner.lfds.lock().unwrap_or_else(|e| e.into_inner()) = lfds.clone();
        *self
            .inner
            .local_addrs
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = laddrs;

        let weak = Arc::downgrade(&self.inner);

        let mut pollers = Vec::with_capacity(self.inner.n_poller);
        for i in 0..self.inner.n_poller {
            match Poller::new(weak.clone(), false, i) {
                Ok(p) => pollers.push(p),
                Err(e) => {
                    for fd in self.inner.listen_fds() {
                        sys::close(fd);
                    }
                    return Err(e);
                }
            }
        }
        let mut listeners = Vec::with_capacity(self.inner.n_listener);
        for i in 0..self.inner.n_listener {
            match Poller::new(weak.clone(), true, i) {
                Ok(l) => listeners.push(l),
                Err(e) => {
                    for fd in self.inner.listen_fds() {
                        sys::close(fd);
                    }
                    return Err(e);
                }
            }
        }
        let _ = self.inner.pollers.set(pollers.clone());
        let _ = self.inner.listeners.set(listeners.clone());

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        for (i, p) in pollers.into_iter().enumerate() {
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let handle = std::thread::Builder::new()
                .name(format!("squall-poller-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    p.run();
                })
                .map_err(SquallError::Io)?;
            self.threads.push(handle);
        }
        for (i, l) in listeners.into_iter().enumerate() {
            let handle = std::thread::Builder::new()
                .name(format!("squall-listener-{}", i))
                .spawn(move || l.run())
                .map_err(SquallError::Io)?;
            self.threads.push(handle);
        }

        self.started = true;
        if self.inner.addrs.is_empty() {
            info!("engine start");
        } else {
            info!("engine start, listen on {:?}", self.inner.addrs);
        }
        Ok(())
    }

    /// Cooperative shutdown: stop pollers, join threads, close listeners,
    /// then close every remaining connection.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        if let Some(ps) = self.inner.pollers.get() {
            for p in ps {
                p.stop();
            }
        }
        if let Some(ls) = self.inner.listeners.get() {
            for l in ls {
                l.stop();
            }
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        for fd in self.inner.listen_fds() {
            sys::close(fd);
        }
        for conn in self.inner.table.snapshot() {
            conn.close_with_err(SquallError::Shutdown);
        }
        self.started = false;
        info!("engine stopped");
    }

    /// Addresses the listeners are actually bound to (useful with port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .local_addrs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Connections currently admitted.
    pub fn current_load(&self) -> i64 {
        self.inner.curr_load.load(Ordering::Acquire)
    }

    /// Connections refused by admission control since start.
    pub fn refused(&self) -> u64 {
        self.inner.refused.load(Ordering::Relaxed)
    }

    /// Hand an established stream (e.g. a dialed client connection) to the
    /// engine. The stream is made nonblocking and bound to a poller like an
    /// accepted connection.
    pub fn attach_stream(&self, stream: std::net::TcpStream) -> SquallResult<Arc<Conn>> {
        use std::os::unix::io::IntoRawFd;

        if !self.started {
            return Err(SquallError::Other("engine not started".to_string()));
        }
        let local = stream.local_addr().map_err(SquallError::Io)?;
        let peer = stream.peer_addr().map_err(SquallError::Io)?;
        stream.set_nonblocking(true).map_err(SquallError::Io)?;
        let fd = stream.into_raw_fd();

        if !self.inner.acceptable(fd) {
            sys::close(fd);
            return Err(SquallError::Other("engine at max load".to_string()));
        }
        let conn = Conn::new(fd, local, peer, Arc::downgrade(&self.inner));
        match self.inner.poller_for(fd) {
            Some(owner) => {
                owner.add_conn(conn.clone())?;
                Ok(conn)
            }
            None => {
                // Conn's Drop returns the fd.
                self.inner.decrease();
                Err(SquallError::Other("no pollers running".to_string()))
            }
        }
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

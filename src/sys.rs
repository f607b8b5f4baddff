//! Raw socket and readiness syscalls.
//!
//! Everything the reactor needs from the OS lives here: listener setup,
//! nonblocking accept/read/write, the `Poll` readiness wrapper (epoll on
//! Linux, kqueue elsewhere), the wakeup pipe, and Linux `sendfile`.

use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking TCP listener bound to `addr` with SO_REUSEADDR.
pub fn create_listen_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        #[cfg(not(target_os = "linux"))]
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        #[cfg(not(target_os = "linux"))]
        if let Err(e) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(e);
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        // TCP_NODELAY on the listener is inherited by accepted sockets.
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        if let Err(e) = bind_addr(fd, addr) {
            libc::close(fd);
            return Err(e);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                #[cfg(any(
                    target_os = "macos",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                let sin = libc::sockaddr_in {
                    sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                #[cfg(target_os = "linux")]
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            SocketAddr::V6(a) => {
                #[cfg(any(
                    target_os = "macos",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                let sin6 = libc::sockaddr_in6 {
                    sin6_len: mem::size_of::<libc::sockaddr_in6>() as u8,
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                #[cfg(target_os = "linux")]
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }
}

/// Accept one pending connection. Returns `None` on EAGAIN.
pub fn accept(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );
        #[cfg(not(target_os = "linux"))]
        let fd = libc::accept(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            };
        }

        #[cfg(not(target_os = "linux"))]
        {
            if let Err(e) = set_nonblocking(fd) {
                libc::close(fd);
                return Err(e);
            }
            let one: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }

        let peer = sockaddr_to_addr(&storage)
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        Ok(Some((fd, peer)))
    }
}

/// The address this socket is bound to.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    unsafe {
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    sockaddr_to_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"))
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Single nonblocking read. Errors (including EAGAIN/EINTR) pass through.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Single nonblocking write. Errors (including EAGAIN/EINTR) pass through.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Vectored write of up to 8 buffers in one syscall.
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);
    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }
    let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Linux zero-copy file-to-socket transfer.
#[cfg(target_os = "linux")]
pub fn sendfile(out_fd: RawFd, in_fd: RawFd, count: usize) -> io::Result<usize> {
    let res = unsafe { libc::sendfile(out_fd, in_fd, ptr::null_mut(), count) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

// ---- Wakeup Pipe ----

/// Create a pipe with both ends non-blocking. Returns (read_fd, write_fd).
pub fn create_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    for fd in fds {
        if let Err(e) = set_nonblocking(fd) {
            close(fds[0]);
            close(fds[1]);
            return Err(e);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Discard any pending wakeup bytes.
pub fn drain_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    while let Ok(n) = read(fd, &mut buf) {
        if n < buf.len() {
            break;
        }
    }
}

// ---- Readiness (epoll on Linux, kqueue elsewhere) ----

#[cfg(target_os = "linux")]
pub use linux_poll::*;

#[cfg(target_os = "linux")]
mod linux_poll {
    use super::*;

    pub use libc::epoll_event;
    pub const POLL_IN: i32 = libc::EPOLLIN;
    pub const POLL_OUT: i32 = libc::EPOLLOUT;
    pub const POLL_ERR: i32 = libc::EPOLLERR;
    pub const POLL_HUP: i32 = libc::EPOLLHUP;

    /// Level-triggered epoll instance.
    pub struct Poll {
        pub fd: c_int,
    }

    impl Poll {
        pub fn new() -> io::Result<Self> {
            unsafe {
                let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
            let mut event = epoll_event {
                events: interests as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
            let mut event = epoll_event {
                events: interests as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> io::Result<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err);
                    }
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
            unsafe {
                let res = libc::epoll_wait(
                    self.fd,
                    events.as_mut_ptr(),
                    events.len() as c_int,
                    timeout_ms,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err);
                }
                Ok(res as usize)
            }
        }
    }

    impl Drop for Poll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use kqueue_poll::*;

#[cfg(not(target_os = "linux"))]
mod kqueue_poll {
    use super::*;
    use libc::{kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_EOF};

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const POLL_IN: i32 = 0x1;
    pub const POLL_OUT: i32 = 0x4;
    pub const POLL_ERR: i32 = 0x8;
    pub const POLL_HUP: i32 = 0x10;

    /// kqueue instance presenting the epoll-shaped interface.
    pub struct Poll {
        pub fd: c_int,
    }

    impl Poll {
        pub fn new() -> io::Result<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
            self.apply(fd, token, interests, EV_ADD)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
            // Read interest is permanent; write interest toggles.
            if (interests & POLL_OUT) != 0 {
                self.apply(fd, token, POLL_OUT, EV_ADD)
            } else {
                self.apply(fd, token, POLL_OUT, EV_DELETE)
            }
        }

        pub fn delete(&self, fd: c_int) -> io::Result<()> {
            self.apply(fd, 0, POLL_IN | POLL_OUT, EV_DELETE)
        }

        fn apply(&self, fd: c_int, token: u64, interests: i32, action: u16) -> io::Result<()> {
            let mut changes = [unsafe { mem::zeroed::<kevent>() }; 2];
            let mut n = 0;
            if (interests & POLL_IN) != 0 {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_READ,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }
            if (interests & POLL_OUT) != 0 {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_WRITE,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }
            unsafe {
                let res = libc::kevent(self.fd, changes.as_ptr(), n as c_int, ptr::null_mut(), 0, ptr::null());
                if res < 0 && action != EV_DELETE {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
            const MAX_BATCH: usize = 128;
            let mut kevents = [unsafe { mem::zeroed::<kevent>() }; MAX_BATCH];
            let batch = events.len().min(MAX_BATCH);

            let ts = timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };

            unsafe {
                let res = libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    kevents.as_mut_ptr(),
                    batch as c_int,
                    if timeout_ms >= 0 { &ts } else { ptr::null() },
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err);
                }

                let n = res as usize;
                for i in 0..n {
                    let mut ev = 0;
                    if kevents[i].filter == EVFILT_READ {
                        ev |= POLL_IN;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        ev |= POLL_OUT;
                    }
                    if (kevents[i].flags & EV_EOF) != 0 {
                        ev |= POLL_HUP;
                    }
                    events[i] = epoll_event {
                        events: ev as u32,
                        u64: kevents[i].udata as u64,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Poll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

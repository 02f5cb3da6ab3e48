//! Thin safe wrappers over the raw syscalls the reactor needs.
//!
//! Everything here returns `io::Error` built from errno so callers can
//! branch on `ErrorKind::WouldBlock` / `raw_os_error()` without touching
//! `unsafe` themselves.

use crate::error::{TzzeroError, TzzeroResult};
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

// ---- Socket operations ----

/// Create a non-blocking, close-on-exec TCP socket with SO_REUSEADDR set
/// and SO_REUSEPORT attempted (warning on failure).
pub fn create_nonblocking_socket() -> TzzeroResult<RawFd> {
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
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
            return Err(err.into());
        }

        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            // Not available everywhere, not fatal.
            tracing::warn!("SO_REUSEPORT not supported: {}", io::Error::last_os_error());
        }

        Ok(fd)
    }
}

/// Bind and listen with the platform maximum backlog. Returns the port
/// actually bound, which differs from `port` when 0 was requested.
pub fn bind_and_listen(fd: RawFd, listen_addr: &str, port: u16) -> TzzeroResult<u16> {
    let ip: Ipv4Addr = if listen_addr.is_empty() || listen_addr == "0.0.0.0" {
        Ipv4Addr::UNSPECIFIED
    } else {
        listen_addr
            .parse()
            .map_err(|_| TzzeroError::Other(format!("Invalid listen address: {}", listen_addr)))?
    };

    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
    };

    unsafe {
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }

    if port == 0 {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let rc = unsafe {
            libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(u16::from_be(addr.sin_port))
    } else {
        Ok(port)
    }
}

/// Accept one connection. Returns the non-blocking, close-on-exec socket
/// and the formatted peer address, or `None` when the queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, String)>> {
    let mut peer: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut peer as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    } else {
        Ok(Some((fd, format_sockaddr(&peer))))
    }
}

/// Accept and immediately close one connection. Used by the EMFILE guard
/// to drain the kernel queue and signal the peer.
pub fn accept_and_discard(listen_fd: RawFd) {
    unsafe {
        let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());
        if fd >= 0 {
            libc::close(fd);
        }
    }
}

/// Open the spare descriptor the acceptor holds against fd exhaustion.
pub fn open_idle_fd() -> io::Result<RawFd> {
    let path = b"/dev/null\0";
    let fd = unsafe {
        libc::open(
            path.as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Half-close the write side.
pub fn shutdown_write(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

pub fn set_tcp_no_delay(fd: RawFd, on: bool) {
    let optval: c_int = if on { 1 } else { 0 };
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const c_void,
            mem::size_of_val(&optval) as socklen_t,
        );
    }
}

pub fn set_keep_alive(fd: RawFd, on: bool) {
    let optval: c_int = if on { 1 } else { 0 };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &optval as *const _ as *const c_void,
            mem::size_of_val(&optval) as socklen_t,
        );
    }
}

/// Fetch and clear the pending SO_ERROR on a socket.
pub fn socket_error(fd: RawFd) -> i32 {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut c_void,
            &mut len,
        )
    };
    if rc < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        err
    }
}

pub fn local_address(fd: RawFd) -> String {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
    let rc = unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc == 0 {
        format_sockaddr(&addr)
    } else {
        String::new()
    }
}

pub fn peer_address(fd: RawFd) -> String {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
    let rc = unsafe { libc::getpeername(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc == 0 {
        format_sockaddr(&addr)
    } else {
        String::new()
    }
}

fn format_sockaddr(addr: &libc::sockaddr_in) -> String {
    let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
    format!("{}:{}", ip, u16::from_be(addr.sin_port))
}

/// Write with SIGPIPE suppressed; a dead peer surfaces as EPIPE instead.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

// ---- Wakeup channel (eventfd) ----

pub fn create_eventfd() -> TzzeroResult<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        Err(io::Error::last_os_error().into())
    } else {
        Ok(fd)
    }
}

pub fn write_eventfd(fd: RawFd) {
    let one: u64 = 1;
    unsafe {
        libc::write(fd, &one as *const u64 as *const c_void, 8);
    }
}

pub fn read_eventfd(fd: RawFd) {
    let mut value: u64 = 0;
    unsafe {
        libc::read(fd, &mut value as *mut u64 as *mut c_void, 8);
    }
}

// ---- Timer descriptor (timerfd) ----

pub fn create_timerfd() -> TzzeroResult<RawFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        Err(io::Error::last_os_error().into())
    } else {
        Ok(fd)
    }
}

/// Re-arm the timer descriptor to fire after `delay`. A zero it_value
/// would disarm the descriptor, so the delay is clamped to 1 microsecond.
pub fn arm_timerfd(fd: RawFd, delay: Duration) {
    let delay = delay.max(Duration::from_micros(1));
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as libc::c_long,
        },
    };
    let rc = unsafe { libc::timerfd_settime(fd, 0, &new_value, ptr::null_mut()) };
    if rc < 0 {
        tracing::warn!("timerfd_settime failed: {}", io::Error::last_os_error());
    }
}

pub fn read_timerfd(fd: RawFd) {
    let mut expirations: u64 = 0;
    unsafe {
        libc::read(fd, &mut expirations as *mut u64 as *mut c_void, 8);
    }
}

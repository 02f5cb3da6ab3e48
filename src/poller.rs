//! Readiness notification layer.
//!
//! A `Poller` stores one callback per registered descriptor and hands it
//! back with each ready event; the event loop, not the poller, invokes
//! the callbacks. The epoll backend is the default; `TZZERO_POLLER`
//! selects among compiled-in backends.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::error::TzzeroResult;

// Interest / observed event flags. ERROR and HUP are output-only.
pub const EVENT_READ: u32 = 0x001;
pub const EVENT_WRITE: u32 = 0x004;
pub const EVENT_ERROR: u32 = 0x008;
pub const EVENT_HUP: u32 = 0x010;
pub const EVENT_EDGE_TRIGGERED: u32 = 0x8000_0000;

/// Per-descriptor dispatch callback, invoked with the observed events.
pub type EventCallback = Arc<dyn Fn(u32) + Send + Sync>;

pub struct PollEvent {
    pub fd: RawFd,
    pub events: u32,
    pub callback: EventCallback,
}

pub trait Poller: Send {
    /// Wait up to `timeout_ms` (-1 blocks) and fill `active_events` with
    /// ready descriptors and their callbacks.
    fn poll(&mut self, timeout_ms: i32, active_events: &mut Vec<PollEvent>) -> TzzeroResult<usize>;

    fn add_fd(&mut self, fd: RawFd, events: u32, callback: EventCallback) -> TzzeroResult<()>;
    fn modify_fd(&mut self, fd: RawFd, events: u32, callback: EventCallback) -> TzzeroResult<()>;
    fn remove_fd(&mut self, fd: RawFd) -> TzzeroResult<()>;
}

/// Create the backend selected by `TZZERO_POLLER`, defaulting to epoll.
pub fn create_poller() -> TzzeroResult<Box<dyn Poller + Send>> {
    if let Ok(requested) = std::env::var("TZZERO_POLLER") {
        if requested != "epoll" {
            tracing::warn!(
                "TZZERO_POLLER={} not compiled in, falling back to epoll",
                requested
            );
        }
    }
    Ok(Box::new(EpollPoller::new()?))
}

const INIT_EVENT_LIST_SIZE: usize = 16;

pub struct EpollPoller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    callbacks: HashMap<RawFd, EventCallback>,
}

impl EpollPoller {
    pub fn new() -> TzzeroResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(EpollPoller {
            epoll_fd: fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            callbacks: HashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> TzzeroResult<()> {
        let mut event = libc::epoll_event {
            events: events_to_epoll(events),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_events: &mut Vec<PollEvent>) -> TzzeroResult<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err.into());
        }

        let n = n as usize;
        if n > 0 {
            active_events.reserve(n);
            for ev in &self.events[..n] {
                let fd = ev.u64 as RawFd;
                if let Some(callback) = self.callbacks.get(&fd) {
                    active_events.push(PollEvent {
                        fd,
                        events: epoll_to_events(ev.events),
                        callback: Arc::clone(callback),
                    });
                }
            }
            if n == self.events.len() {
                self.events
                    .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        }

        Ok(n)
    }

    fn add_fd(&mut self, fd: RawFd, events: u32, callback: EventCallback) -> TzzeroResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)?;
        self.callbacks.insert(fd, callback);
        Ok(())
    }

    fn modify_fd(&mut self, fd: RawFd, events: u32, callback: EventCallback) -> TzzeroResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)?;
        self.callbacks.insert(fd, callback);
        Ok(())
    }

    fn remove_fd(&mut self, fd: RawFd) -> TzzeroResult<()> {
        self.callbacks.remove(&fd);
        let rc =
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

fn events_to_epoll(events: u32) -> u32 {
    let mut epoll_events = 0u32;
    if events & EVENT_READ != 0 {
        epoll_events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if events & EVENT_WRITE != 0 {
        epoll_events |= libc::EPOLLOUT as u32;
    }
    if events & EVENT_EDGE_TRIGGERED != 0 {
        epoll_events |= libc::EPOLLET as u32;
    }
    epoll_events
}

fn epoll_to_events(epoll_events: u32) -> u32 {
    let mut events = 0u32;
    if epoll_events & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
        events |= EVENT_READ;
    }
    if epoll_events & libc::EPOLLOUT as u32 != 0 {
        events |= EVENT_WRITE;
    }
    if epoll_events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
        events |= EVENT_ERROR;
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn translation_maps_hup_to_error() {
        assert_eq!(
            epoll_to_events((libc::EPOLLERR | libc::EPOLLHUP) as u32),
            EVENT_ERROR
        );
        assert_eq!(epoll_to_events(libc::EPOLLRDHUP as u32), EVENT_READ);
        assert_eq!(
            epoll_to_events((libc::EPOLLIN | libc::EPOLLOUT) as u32),
            EVENT_READ | EVENT_WRITE
        );
    }

    #[test]
    fn poll_returns_registered_callback() {
        let mut poller = EpollPoller::new().unwrap();

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let observed = Arc::new(AtomicU32::new(0));
        let observed_cb = Arc::clone(&observed);
        poller
            .add_fd(
                fds[0],
                EVENT_READ,
                Arc::new(move |revents| {
                    observed_cb.store(revents, Ordering::SeqCst);
                }),
            )
            .unwrap();

        unsafe {
            libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1);
        }

        let mut active = Vec::new();
        let n = poller.poll(1000, &mut active).unwrap();
        assert_eq!(n, 1);
        assert_eq!(active[0].fd, fds[0]);
        assert!(active[0].events & EVENT_READ != 0);

        // The poller hands the callback back; the caller invokes it.
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        (active[0].callback)(active[0].events);
        assert!(observed.load(Ordering::SeqCst) & EVENT_READ != 0);

        poller.remove_fd(fds[0]).unwrap();
        crate::sys::close_fd(fds[0]);
        crate::sys::close_fd(fds[1]);
    }
}

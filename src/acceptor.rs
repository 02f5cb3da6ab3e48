//! Listening socket: drains the accept queue on each readable wakeup and
//! survives descriptor exhaustion with a reserved spare fd.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::error::TzzeroResult;
use crate::event_loop::EventLoop;
use crate::poller::EVENT_READ;
use crate::sys;

pub type NewConnectionCallback = Box<dyn FnMut(RawFd, String) + Send>;

// Bounds per-wakeup latency while preventing accept starvation.
const MAX_ACCEPT_PER_LOOP: usize = 10_000;

pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    listen_addr: String,
    port: u16,
    accept_fd: RawFd,
    idle_fd: Mutex<RawFd>,
    listening: AtomicBool,
    bound_port: AtomicU16,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        event_loop: Arc<EventLoop>,
        listen_addr: &str,
        port: u16,
    ) -> TzzeroResult<Arc<Acceptor>> {
        let accept_fd = sys::create_nonblocking_socket()?;
        let idle_fd = match sys::open_idle_fd() {
            Ok(fd) => fd,
            Err(e) => {
                sys::close_fd(accept_fd);
                return Err(e.into());
            }
        };

        Ok(Arc::new(Acceptor {
            event_loop,
            listen_addr: listen_addr.to_string(),
            port,
            accept_fd,
            idle_fd: Mutex::new(idle_fd),
            listening: AtomicBool::new(false),
            bound_port: AtomicU16::new(0),
            new_connection_callback: Mutex::new(None),
        }))
    }

    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection_callback.lock().unwrap() = Some(callback);
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// The port actually bound; differs from the requested port when 0
    /// was requested. Zero until `listen` has run.
    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }

    /// Bind, listen and register with the owning loop's poller. Must run
    /// on the loop thread.
    pub fn listen(self: &Arc<Self>) -> TzzeroResult<()> {
        if self.listening.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let actual = sys::bind_and_listen(self.accept_fd, &self.listen_addr, self.port)?;
        self.bound_port.store(actual, Ordering::Release);

        let weak = Arc::downgrade(self);
        self.event_loop.poller().add_fd(
            self.accept_fd,
            EVENT_READ,
            Arc::new(move |_| {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.handle_read();
                }
            }),
        )?;

        Ok(())
    }

    /// Deregister from the poller and stop accepting. Must run on the
    /// loop thread.
    pub fn stop(&self) {
        if self.listening.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.event_loop.poller().remove_fd(self.accept_fd) {
                error!("failed to deregister acceptor: {}", e);
            }
        }
    }

    fn handle_read(&self) {
        let mut callback = self.new_connection_callback.lock().unwrap();

        for _ in 0..MAX_ACCEPT_PER_LOOP {
            match sys::accept_connection(self.accept_fd) {
                Ok(Some((conn_fd, peer_addr))) => {
                    if let Some(cb) = callback.as_mut() {
                        cb(conn_fd, peer_addr);
                    } else {
                        sys::close_fd(conn_fd);
                    }
                }
                Ok(None) => break, // queue drained
                Err(err) => {
                    match err.raw_os_error() {
                        Some(libc::EMFILE) | Some(libc::ENFILE) => {
                            // Out of descriptors: release the spare, take
                            // one connection off the queue so the peer
                            // sees a close instead of a hang, re-reserve.
                            let mut idle = self.idle_fd.lock().unwrap();
                            sys::close_fd(*idle);
                            sys::accept_and_discard(self.accept_fd);
                            *idle = sys::open_idle_fd().unwrap_or(-1);
                            error!("accept: {} - connection rejected", err);
                        }
                        _ => {
                            error!("accept error: {}", err);
                        }
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        sys::close_fd(self.accept_fd);
        let idle = *self.idle_fd.lock().unwrap();
        if idle >= 0 {
            sys::close_fd(idle);
        }
    }
}

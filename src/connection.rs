//! Per-connection state machine with input/output buffers.
//!
//! Every handler and state transition runs on the owning worker loop;
//! `send`, `shutdown` and `force_close` may be called from any thread and
//! are converted to loop tasks. Callbacks registered with the poller hold
//! only a weak reference back to the connection, so the server registry
//! stays the owner of record.

use std::any::Any;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, trace};

use crate::buffer::Buffer;
use crate::event_loop::EventLoop;
use crate::poller::{EventCallback, EVENT_ERROR, EVENT_READ, EVENT_WRITE};
use crate::sys;

pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    socket_fd: RawFd,
    local_addr: String,
    peer_addr: String,
    state: AtomicU8,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    message_callback: Mutex<Option<MessageCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    // The callback registered with the poller, kept so interest changes
    // can re-register it.
    channel_callback: Mutex<Option<EventCallback>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl TcpConnection {
    pub fn new(event_loop: Arc<EventLoop>, name: String, socket_fd: RawFd) -> Arc<TcpConnection> {
        let local_addr = sys::local_address(socket_fd);
        let peer_addr = sys::peer_address(socket_fd);

        debug!(
            "TcpConnection created: {} fd={} local={} peer={}",
            name, socket_fd, local_addr, peer_addr
        );

        Arc::new(TcpConnection {
            event_loop,
            name,
            socket_fd,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            message_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            channel_callback: Mutex::new(None),
            context: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> RawFd {
        self.socket_fd
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn local_address(&self) -> &str {
        &self.local_addr
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_callback.lock().unwrap() = Some(callback);
        self.high_water_mark.store(mark, Ordering::Release);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        sys::set_tcp_no_delay(self.socket_fd, on);
    }

    pub fn set_keep_alive(&self, on: bool) {
        sys::set_keep_alive(self.socket_fd, on);
    }

    /// Opaque per-connection slot; the HTTP layer parks its parser here.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(context);
    }

    pub fn context(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.context.lock().unwrap()
    }

    /// Thread-safe send; copies when crossing threads.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let message = data.to_vec();
            let conn = Arc::clone(self);
            self.event_loop.run_in_loop(move || {
                conn.send_in_loop(&message);
            });
        }
    }

    pub fn send_str(self: &Arc<Self>, message: &str) {
        self.send(message.as_bytes());
    }

    /// Send everything readable in `buffer`, leaving it empty.
    pub fn send_buffer(self: &Arc<Self>, buffer: &mut Buffer) {
        if self.state() != ConnState::Connected {
            return;
        }
        let len = buffer.readable_bytes();
        let data = buffer.retrieve_as_bytes(len);
        self.send(&data);
    }

    /// Half-close the write side once the output buffer drains.
    pub fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                ConnState::Connected as u8,
                ConnState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = Arc::clone(self);
            self.event_loop.run_in_loop(move || {
                conn.shutdown_in_loop();
            });
        }
    }

    /// Immediate teardown regardless of unsent data.
    pub fn force_close(self: &Arc<Self>) {
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.state
                .store(ConnState::Disconnecting as u8, Ordering::Release);
            let conn = Arc::clone(self);
            self.event_loop.run_in_loop(move || {
                conn.force_close_in_loop();
            });
        }
    }

    /// First half of the ownership handoff: runs on the worker loop,
    /// registers the socket and flips to CONNECTED.
    pub fn connection_established(self: &Arc<Self>) {
        assert!(self.event_loop.is_in_loop_thread());
        assert_eq!(self.state(), ConnState::Connecting);

        self.state
            .store(ConnState::Connected as u8, Ordering::Release);

        let weak = Arc::downgrade(self);
        let callback: EventCallback = Arc::new(move |revents| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_event(revents);
            }
        });
        *self.channel_callback.lock().unwrap() = Some(Arc::clone(&callback));

        if let Err(e) = self
            .event_loop
            .poller()
            .add_fd(self.socket_fd, EVENT_READ, callback)
        {
            error!("{}: failed to register socket: {}", self.name, e);
        }
    }

    /// Final teardown on the worker loop after the server registry has
    /// dropped its reference.
    pub fn connection_destroyed(self: &Arc<Self>) {
        assert!(self.event_loop.is_in_loop_thread());

        if self.state() == ConnState::Connected {
            self.state
                .store(ConnState::Disconnected as u8, Ordering::Release);
            if let Err(e) = self.event_loop.poller().remove_fd(self.socket_fd) {
                error!("{}: failed to deregister socket: {}", self.name, e);
            }
        }
        self.channel_callback.lock().unwrap().take();
        debug!("TcpConnection destroyed: {}", self.name);
    }

    fn handle_event(self: &Arc<Self>, revents: u32) {
        if revents & EVENT_READ != 0 {
            self.handle_read();
        }
        if revents & EVENT_WRITE != 0 {
            self.handle_write();
        }
        if revents & EVENT_ERROR != 0 {
            self.handle_error();
        }
    }

    fn handle_read(self: &Arc<Self>) {
        assert!(self.event_loop.is_in_loop_thread());

        let mut input = self.input_buffer.lock().unwrap();
        match input.read_fd(self.socket_fd) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                trace!("{}: read {} bytes", self.name, n);
                let callback = self.message_callback.lock().unwrap().clone();
                if let Some(cb) = callback {
                    cb(self, &mut input);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(input);
                error!("{}: read error: {}", self.name, e);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        assert!(self.event_loop.is_in_loop_thread());

        let state = self.state();
        if state != ConnState::Connected && state != ConnState::Disconnecting {
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        match output.write_fd(self.socket_fd) {
            Ok(n) if n > 0 => {
                if output.readable_bytes() == 0 {
                    drop(output);
                    self.modify_interest(EVENT_READ);
                    self.queue_write_complete();
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("{}: write error: {}", self.name, e);
            }
        }
    }

    /// Idempotent: a READ-EOF and an ERROR observed in the same poll both
    /// funnel here, but the close callback fires exactly once.
    fn handle_close(self: &Arc<Self>) {
        assert!(self.event_loop.is_in_loop_thread());

        let prev = self
            .state
            .swap(ConnState::Disconnected as u8, Ordering::AcqRel);
        if ConnState::from_u8(prev) == ConnState::Disconnected {
            return;
        }

        if let Err(e) = self.event_loop.poller().remove_fd(self.socket_fd) {
            error!("{}: failed to deregister socket: {}", self.name, e);
        }
        self.channel_callback.lock().unwrap().take();

        // Strong reference for the duration of the call: the close
        // callback may drop the final registry reference.
        let guard = Arc::clone(self);
        let callback = self.close_callback.lock().unwrap().clone();
        if let Some(cb) = callback {
            cb(&guard);
        }
    }

    fn handle_error(self: &Arc<Self>) {
        assert!(self.event_loop.is_in_loop_thread());

        let err = sys::socket_error(self.socket_fd);
        if err != 0 {
            error!(
                "{}: SO_ERROR: {}",
                self.name,
                io::Error::from_raw_os_error(err)
            );
        }
        self.handle_close();
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        assert!(self.event_loop.is_in_loop_thread());

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        let mut output = self.output_buffer.lock().unwrap();

        // Nothing queued: try one direct write first.
        if self.state() == ConnState::Connected && output.readable_bytes() == 0 {
            match sys::write(self.socket_fd, data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        drop(output);
                        self.queue_write_complete();
                        return;
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!("{}: send error: {}", self.name, e);
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let new_len = old_len + remaining;
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if new_len >= mark && old_len < mark {
                let callback = self.high_water_mark_callback.lock().unwrap().clone();
                if let Some(cb) = callback {
                    let conn = Arc::clone(self);
                    self.event_loop.queue_in_loop(move || {
                        cb(&conn, new_len);
                    });
                }
            }

            output.append(&data[nwrote..]);
            drop(output);
            self.modify_interest(EVENT_READ | EVENT_WRITE);
        }
    }

    fn shutdown_in_loop(&self) {
        assert!(self.event_loop.is_in_loop_thread());
        if self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            sys::shutdown_write(self.socket_fd);
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        assert!(self.event_loop.is_in_loop_thread());
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.handle_close();
        }
    }

    fn modify_interest(&self, events: u32) {
        let callback = self.channel_callback.lock().unwrap().clone();
        if let Some(cb) = callback {
            if let Err(e) = self
                .event_loop
                .poller()
                .modify_fd(self.socket_fd, events, cb)
            {
                error!("{}: failed to modify interest: {}", self.name, e);
            }
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let callback = self.write_complete_callback.lock().unwrap().clone();
        if let Some(cb) = callback {
            let conn = Arc::clone(self);
            self.event_loop.queue_in_loop(move || {
                cb(&conn);
            });
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!("TcpConnection dropped: {} fd={}", self.name, self.socket_fd);
        sys::close_fd(self.socket_fd);
    }
}

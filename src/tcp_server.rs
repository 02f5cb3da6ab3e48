//! TCP server: binds the acceptor to the main loop, distributes accepted
//! sockets to worker loops and tracks the connection registry.
//!
//! The registry is owned by the main loop; every mutation happens there.
//! Socket ownership transfers to a worker loop atomically through the
//! scheduled `connection_established` task.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::error::TzzeroResult;
use crate::event_loop::EventLoop;
use crate::event_loop_pool::EventLoopThreadPool;

// Grace period for draining connections on stop before force-closing.
const STOP_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

pub struct TcpServer {
    event_loop: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_pool: EventLoopThreadPool,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
}

impl TcpServer {
    pub fn new(
        event_loop: Arc<EventLoop>,
        listen_addr: &str,
        port: u16,
        name: &str,
    ) -> TzzeroResult<Arc<TcpServer>> {
        let acceptor = Acceptor::new(Arc::clone(&event_loop), listen_addr, port)?;
        let thread_pool = EventLoopThreadPool::new(Arc::clone(&event_loop));

        let server = Arc::new(TcpServer {
            event_loop,
            ip_port: format!("{}:{}", listen_addr, port),
            name: name.to_string(),
            acceptor,
            thread_pool,
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |sockfd, peer_addr| {
                if let Some(srv) = weak.upgrade() {
                    srv.new_connection(sockfd, peer_addr);
                }
            }));

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// Port actually bound; useful when port 0 was requested. Zero until
    /// the acceptor has started listening.
    pub fn listen_port(&self) -> u16 {
        self.acceptor.bound_port()
    }

    /// Must be called before `start`.
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started.load(Ordering::Acquire));
        self.thread_pool.set_thread_num(num_threads);
    }

    pub fn pin_cpus(&self, on: bool) {
        self.thread_pool.pin_cpus(on);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(callback);
    }

    /// Idempotent: spins up the worker pool, then binds and listens on
    /// the main loop.
    pub fn start(self: &Arc<Self>) -> TzzeroResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.thread_pool.start()?;

        let acceptor = Arc::clone(&self.acceptor);
        let name = self.name.clone();
        self.event_loop.run_in_loop(move || {
            if let Err(e) = acceptor.listen() {
                error!("TcpServer [{}] failed to listen: {}", name, e);
            }
        });

        info!("TcpServer [{}] started on {}", self.name, self.ip_port);
        Ok(())
    }

    /// Drain-with-deadline shutdown: stop accepting, half-close every
    /// connection, force-close whatever is still open at the deadline.
    pub fn stop(self: &Arc<Self>) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("TcpServer [{}] stopping", self.name);

        let server = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            server.acceptor.stop();

            let conns: Vec<Arc<TcpConnection>> = server
                .connections
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            for conn in &conns {
                conn.shutdown();
            }

            if !conns.is_empty() {
                server.event_loop.run_after(STOP_DRAIN_DEADLINE, move || {
                    for conn in &conns {
                        conn.force_close();
                    }
                });
            }
        });
    }

    fn new_connection(self: &Arc<Self>, sockfd: RawFd, peer_addr: String) {
        assert!(self.event_loop.is_in_loop_thread());

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);

        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let io_loop = self.thread_pool.get_next_loop();
        let conn = TcpConnection::new(Arc::clone(&io_loop), conn_name.clone(), sockfd);

        if let Some(cb) = self.message_callback.lock().unwrap().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(srv) = weak.upgrade() {
                srv.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, Arc::clone(&conn));

        let user_callback = self.connection_callback.lock().unwrap().clone();
        io_loop.run_in_loop(move || {
            conn.connection_established();
            if let Some(cb) = user_callback {
                cb(&conn);
            }
        });
    }

    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let server = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.event_loop.run_in_loop(move || {
            server.remove_connection_in_loop(&conn);
        });
    }

    fn remove_connection_in_loop(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        assert!(self.event_loop.is_in_loop_thread());

        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );

        if self
            .connections
            .lock()
            .unwrap()
            .remove(conn.name())
            .is_none()
        {
            warn!(
                "TcpServer [{}] - connection {} was not registered",
                self.name,
                conn.name()
            );
        }

        let io_loop = Arc::clone(conn.owner_loop());
        let user_callback = self.connection_callback.lock().unwrap().clone();
        let conn = Arc::clone(conn);
        io_loop.queue_in_loop(move || {
            conn.connection_destroyed();
            if let Some(cb) = user_callback {
                cb(&conn);
            }
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let conns: Vec<Arc<TcpConnection>> =
            self.connections.lock().unwrap().drain().map(|(_, c)| c).collect();
        for conn in conns {
            let io_loop = Arc::clone(conn.owner_loop());
            io_loop.run_in_loop(move || {
                conn.connection_destroyed();
            });
        }
    }
}

//! HTTP server facade over the TCP server.
//!
//! Installs the connection and message callbacks, parks one parser per
//! connection in its context slot, dispatches completed requests to the
//! application callback and serializes the response.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::error::TzzeroResult;
use crate::event_loop::EventLoop;
use crate::http::parser::HttpParser;
use crate::http::request::HttpRequest;
use crate::http::response::{HttpResponse, HttpStatusCode};
use crate::tcp_server::TcpServer;

pub type HttpCallback = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

pub struct HttpServer {
    server: Arc<TcpServer>,
    http_callback: Mutex<Option<HttpCallback>>,
    keep_alive_enabled: AtomicBool,
    keep_alive_timeout_secs: AtomicU32,
    // Reserved hook; the HTTP/1.x core does not drive it.
    http2_enabled: AtomicBool,
}

impl HttpServer {
    pub fn new(
        event_loop: Arc<EventLoop>,
        listen_addr: &str,
        port: u16,
        name: &str,
    ) -> TzzeroResult<Arc<HttpServer>> {
        let server = TcpServer::new(event_loop, listen_addr, port, name)?;

        let http_server = Arc::new(HttpServer {
            server,
            http_callback: Mutex::new(None),
            keep_alive_enabled: AtomicBool::new(true),
            keep_alive_timeout_secs: AtomicU32::new(60),
            http2_enabled: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&http_server);
        http_server
            .server
            .set_connection_callback(Arc::new(move |conn| {
                if let Some(srv) = weak.upgrade() {
                    srv.on_connection(conn);
                }
            }));

        let weak = Arc::downgrade(&http_server);
        http_server
            .server
            .set_message_callback(Arc::new(move |conn, buffer| {
                if let Some(srv) = weak.upgrade() {
                    srv.on_message(conn, buffer);
                }
            }));

        Ok(http_server)
    }

    pub fn start(self: &Arc<Self>) -> TzzeroResult<()> {
        self.server.start()
    }

    pub fn stop(self: &Arc<Self>) {
        self.server.stop();
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.server.set_thread_num(num_threads);
    }

    pub fn pin_cpus(&self, on: bool) {
        self.server.pin_cpus(on);
    }

    pub fn listen_port(&self) -> u16 {
        self.server.listen_port()
    }

    pub fn set_http_callback<F>(&self, callback: F)
    where
        F: Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    {
        *self.http_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn enable_keep_alive(&self, enable: bool) {
        self.keep_alive_enabled.store(enable, Ordering::Release);
    }

    pub fn set_keep_alive_timeout(&self, seconds: u32) {
        self.keep_alive_timeout_secs.store(seconds, Ordering::Release);
    }

    pub fn enable_http2(&self, enable: bool) {
        self.http2_enabled.store(enable, Ordering::Release);
    }

    fn on_connection(&self, conn: &Arc<TcpConnection>) {
        info!(
            "HttpServer - {} -> {} is {}",
            conn.local_address(),
            conn.peer_address(),
            if conn.connected() { "UP" } else { "DOWN" }
        );

        if conn.connected() {
            conn.set_context(Box::new(HttpParser::new()));
            conn.set_tcp_no_delay(true);
            conn.set_keep_alive(true);
        }
    }

    fn on_message(&self, conn: &Arc<TcpConnection>, buffer: &mut Buffer) {
        let mut context = conn.context();
        if context.as_ref().map(|c| c.is::<HttpParser>()) != Some(true) {
            *context = Some(Box::new(HttpParser::new()));
        }
        let parser = context
            .as_mut()
            .and_then(|c| c.downcast_mut::<HttpParser>())
            .expect("context holds the HTTP parser");

        if parser.parse(buffer) {
            let request = parser.take_request();
            parser.reset();
            drop(context);
            self.on_request(conn, &request);
        } else if parser.has_error() {
            error!("HTTP parse error from {}", conn.peer_address());
            drop(context);
            conn.shutdown();
        }
        // Incomplete: wait for more bytes.
    }

    fn on_request(&self, conn: &Arc<TcpConnection>, request: &HttpRequest) {
        let mut response = HttpResponse::new();
        response.set_header("Server", "TZZeroHTTP/1.0");

        let close =
            !request.keep_alive() || !self.keep_alive_enabled.load(Ordering::Acquire);
        response.set_close_connection(close);

        if close {
            response.set_header("Connection", "close");
        } else {
            response.set_header("Connection", "keep-alive");
            let timeout = self.keep_alive_timeout_secs.load(Ordering::Acquire);
            if timeout > 0 {
                response.set_header("Keep-Alive", &format!("timeout={}", timeout));
            }
        }

        let callback = self.http_callback.lock().unwrap().clone();
        match callback {
            Some(cb) => cb(request, &mut response),
            None => {
                response.set_status_code(HttpStatusCode::NotFound);
                response.set_html_content_type();
                response.set_body("<html><body><h1>404 Not Found</h1></body></html>");
            }
        }

        conn.send(&response.to_bytes());

        if response.close_connection() {
            conn.shutdown();
        }
    }
}

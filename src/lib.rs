//! tzzero: a non-blocking HTTP/1.x server framework on a multi-loop
//! reactor core.
//!
//! One event loop per thread; the main loop owns the acceptor, worker
//! loops own the connections. The HTTP layer sits on top of the TCP
//! server as a thin facade: register a single `(request, response)`
//! callback and the framework handles parsing, serialization and
//! keep-alive connection reuse.

pub mod acceptor;
pub mod buffer;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod event_loop_pool;
pub mod http;
pub mod logging;
pub mod poller;
pub mod sys;
pub mod tcp_server;
pub mod timer;

pub use buffer::Buffer;
pub use connection::{ConnState, TcpConnection};
pub use error::{TzzeroError, TzzeroResult};
pub use event_loop::EventLoop;
pub use http::{HttpMethod, HttpRequest, HttpResponse, HttpServer, HttpStatusCode, HttpVersion};
pub use logging::{init_logging, init_logging_with_level};
pub use tcp_server::TcpServer;

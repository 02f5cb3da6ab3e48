//! End-to-end tests over real sockets: a live server on an ephemeral
//! port, driven with blocking clients.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tzzero::http::{HttpServer, HttpStatusCode};
use tzzero::EventLoop;

struct TestServer {
    event_loop: Arc<EventLoop>,
    server: Arc<HttpServer>,
    port: u16,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start() -> TestServer {
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let server =
                HttpServer::new(Arc::clone(&event_loop), "127.0.0.1", 0, "test").unwrap();
            server.set_thread_num(1);
            server.set_http_callback(|request, response| match request.path() {
                "/hello" => {
                    response.set_status_code(HttpStatusCode::Ok);
                    response.set_text_content_type();
                    response.set_body("hi");
                }
                "/echo" => {
                    response.set_status_code(HttpStatusCode::Ok);
                    response.set_body(request.body().to_vec());
                }
                _ => {
                    response.set_status_code(HttpStatusCode::NotFound);
                    response.set_body("nope");
                }
            });
            server.start().unwrap();
            tx.send((Arc::clone(&event_loop), Arc::clone(&server)))
                .unwrap();
            event_loop.run();
        });

        let (event_loop, server) = rx.recv().unwrap();

        // The acceptor binds asynchronously on the loop; wait for it.
        let mut port = 0;
        for _ in 0..500 {
            port = server.listen_port();
            if port != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_ne!(port, 0, "acceptor never bound");

        TestServer {
            event_loop,
            server,
            port,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.stop();
        self.event_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Read one response: headers through the blank line, then exactly
/// Content-Length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            line.to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(|v| v.trim().parse::<usize>().unwrap())
        })
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&tmp[..n]);
    }

    (head, body)
}

#[test]
fn get_returns_response_with_synthesized_headers() {
    let server = TestServer::start();
    let mut stream = server.connect();

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("server: TZZeroHTTP/1.0\r\n"));
    assert!(head.contains("connection: keep-alive\r\n"));
    assert!(head.contains("date: "));
    assert_eq!(body, b"hi");
}

#[test]
fn keep_alive_serves_two_requests_on_one_connection() {
    let server = TestServer::start();
    let mut stream = server.connect();

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (head1, body1) = read_response(&mut stream);
    assert!(head1.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body1, b"hi");

    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (head2, body2) = read_response(&mut stream);
    assert!(head2.starts_with("HTTP/1.1 404 Not Found"));
    assert_eq!(body2, b"nope");
}

#[test]
fn connection_close_half_closes_after_response() {
    let server = TestServer::start();
    let mut stream = server.connect();

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap(); // EOF arrives only on close
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("connection: close\r\n"));
    assert!(text.ends_with("hi"));
}

#[test]
fn post_body_is_delivered_to_the_handler() {
    let server = TestServer::start();
    let mut stream = server.connect();

    let payload = br#"{"key": "value"}"#;
    let request = format!(
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    );
    stream.write_all(request.as_bytes()).unwrap();
    stream.write_all(payload).unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, payload);
}

#[test]
fn fragmented_request_is_reassembled() {
    let server = TestServer::start();
    let mut stream = server.connect();

    stream.write_all(b"GET /hello HTT").unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    stream
        .write_all(b"P/1.1\r\nHost: local")
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"host\r\n\r\n").unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"hi");
}

#[test]
fn malformed_request_line_closes_the_connection() {
    let server = TestServer::start();
    let mut stream = server.connect();

    stream
        .write_all(b"BREW /pot HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    // Protocol error: the server shuts down without a response.
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    assert!(raw.is_empty());
}

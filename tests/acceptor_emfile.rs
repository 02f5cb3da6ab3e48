//! EMFILE non-regression: after descriptor exhaustion forces the
//! acceptor through its spare-descriptor recovery, the server must keep
//! accepting connections.
//!
//! This test lives in its own binary because it lowers RLIMIT_NOFILE and
//! fills the process descriptor table; it must not share a process with
//! other tests.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tzzero::http::{HttpServer, HttpStatusCode};
use tzzero::{sys, EventLoop};

fn read_response_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return String::from_utf8_lossy(&buf[..pos + 4]).into_owned();
        }
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&tmp[..n]);
    }
}

fn get_ok(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let head = read_response_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);
    stream
}

#[test]
fn acceptor_recovers_from_descriptor_exhaustion() {
    let (tx, rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server =
            HttpServer::new(Arc::clone(&event_loop), "127.0.0.1", 0, "emfile-test").unwrap();
        server.set_thread_num(1);
        server.set_http_callback(|_request, response| {
            response.set_status_code(HttpStatusCode::Ok);
            response.set_text_content_type();
            response.set_body("ok");
        });
        server.start().unwrap();
        tx.send((Arc::clone(&event_loop), Arc::clone(&server)))
            .unwrap();
        event_loop.run();
    });
    let (event_loop, server) = rx.recv().unwrap();

    let mut port = 0;
    for _ in 0..500 {
        port = server.listen_port();
        if port != 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_ne!(port, 0, "acceptor never bound");

    // Baseline request. The connection is held open for the whole test
    // so closing it cannot free a descriptor mid-exhaustion.
    let baseline = get_ok(port);

    // Keep the descriptor table small so exhausting it stays cheap.
    let original = unsafe {
        let mut rl: libc::rlimit = std::mem::zeroed();
        assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl), 0);
        rl
    };
    let mut lowered = original;
    lowered.rlim_cur = 256.min(original.rlim_max);
    unsafe {
        assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &lowered), 0);
    }

    // Park the main loop so the next connection waits in the kernel
    // backlog until the table is full.
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    event_loop.queue_in_loop(move || {
        entered_tx.send(()).ok();
        let _ = gate_rx.recv_timeout(Duration::from_secs(10));
    });
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("main loop never parked");

    // The handshake completes in the kernel; accept happens only after
    // the loop resumes.
    let mut rejected = TcpStream::connect(("127.0.0.1", port)).unwrap();
    rejected
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // Exhaust every remaining descriptor.
    let mut hogs = Vec::new();
    loop {
        match sys::open_idle_fd() {
            Ok(fd) => hogs.push(fd),
            Err(_) => break,
        }
    }
    assert!(!hogs.is_empty(), "descriptor table was already full");

    // Resume the loop: accept fails with EMFILE and the guard drains
    // the queued connection, which the peer observes as a close.
    gate_tx.send(()).unwrap();

    let mut buf = [0u8; 16];
    match rejected.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("rejected connection unexpectedly got {} bytes", n),
        Err(e) => assert!(
            matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ),
            "unexpected error on rejected connection: {}",
            e
        ),
    }

    // Free the descriptors; the server must accept and answer again.
    for fd in hogs.drain(..) {
        sys::close_fd(fd);
    }
    unsafe {
        libc::setrlimit(libc::RLIMIT_NOFILE, &original);
    }

    let recovered = get_ok(port);

    drop(recovered);
    drop(baseline);
    server.stop();
    event_loop.quit();
    server_thread.join().unwrap();
}

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use tzzero::http::{HttpRequest, HttpResponse, HttpServer, HttpStatusCode};
use tzzero::{init_logging_with_level, EventLoop, TzzeroResult};

#[derive(Parser)]
#[command(name = "tzzero")]
#[command(about = "Non-blocking HTTP/1.x server on a multi-loop reactor")]
#[command(version)]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0")]
    addr: String,

    /// Listen port
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Worker threads (defaults to the CPU count)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Keep-Alive timeout advertised to clients, in seconds
    #[arg(long, default_value_t = 60)]
    keep_alive_timeout: u32,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Pin worker threads to CPU cores
    #[arg(long)]
    pin_cpus: bool,
}

fn welcome_page() -> &'static str {
    r#"<!DOCTYPE html>
<html>
<head>
    <title>TZZero HTTP Server</title>
</head>
<body>
    <h1>TZZero HTTP Server</h1>
    <p>Server is running.</p>
    <ul>
        <li><a href="/api/status">Status API</a></li>
        <li><a href="/api/hello">Hello API</a></li>
        <li><a href="/test">Test Page</a></li>
    </ul>
</body>
</html>"#
}

fn http_handler(request: &HttpRequest, response: &mut HttpResponse) {
    match request.path() {
        "/" => {
            response.set_status_code(HttpStatusCode::Ok);
            response.set_html_content_type();
            response.set_body(welcome_page());
        }
        "/api/status" => {
            response.set_status_code(HttpStatusCode::Ok);
            response.set_json_content_type();
            response.set_body(r#"{"status": "ok", "version": "1.0.0"}"#);
        }
        "/api/hello" => {
            response.set_status_code(HttpStatusCode::Ok);
            response.set_json_content_type();
            response.set_body(r#"{"message": "hello"}"#);
        }
        "/test" => {
            response.set_status_code(HttpStatusCode::Ok);
            response.set_html_content_type();
            response.set_body(format!(
                "<html><body><h1>Test Page</h1><p>Method: {}</p><p>Path: {}</p></body></html>",
                request.method().as_str(),
                request.path()
            ));
        }
        _ => {
            response.set_status_code(HttpStatusCode::NotFound);
            response.set_html_content_type();
            response.set_body("<html><body><h1>404 Not Found</h1></body></html>");
        }
    }
}

fn main() -> TzzeroResult<()> {
    let cli = Cli::parse();
    init_logging_with_level(&cli.log_level);

    let threads = cli.threads.unwrap_or_else(num_cpus::get);

    let event_loop = EventLoop::new()?;
    let server = HttpServer::new(Arc::clone(&event_loop), &cli.addr, cli.port, "TZZeroHTTP")?;
    server.set_thread_num(threads);
    server.set_keep_alive_timeout(cli.keep_alive_timeout);
    if cli.pin_cpus {
        server.pin_cpus(true);
    }
    server.set_http_callback(http_handler);
    server.start()?;

    {
        let event_loop = Arc::clone(&event_loop);
        let server = Arc::clone(&server);
        ctrlc::set_handler(move || {
            info!("received shutdown signal");
            server.stop();
            event_loop.quit();
        })
        .expect("failed to install signal handler");
    }

    event_loop.run_every(Duration::from_secs(30), || {
        info!("server status: running");
    });

    info!(
        "listening on {}:{} with {} worker threads",
        cli.addr, cli.port, threads
    );

    event_loop.run();
    info!("event loop stopped");
    Ok(())
}

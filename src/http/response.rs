//! HTTP response model and wire serialization.

use std::time::SystemTime;

use crate::http::request::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HttpStatusCode {
    // 1xx Informational
    Continue = 100,
    SwitchingProtocols = 101,

    // 2xx Success
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,
    PartialContent = 206,

    // 3xx Redirection
    MovedPermanently = 301,
    Found = 302,
    NotModified = 304,
    TemporaryRedirect = 307,

    // 4xx Client Error
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    RequestTimeout = 408,
    LengthRequired = 411,
    PayloadTooLarge = 413,

    // 5xx Server Error
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
    HttpVersionNotSupported = 505,
}

impl HttpStatusCode {
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    pub fn reason(&self) -> &'static str {
        match self {
            HttpStatusCode::Continue => "Continue",
            HttpStatusCode::SwitchingProtocols => "Switching Protocols",
            HttpStatusCode::Ok => "OK",
            HttpStatusCode::Created => "Created",
            HttpStatusCode::Accepted => "Accepted",
            HttpStatusCode::NoContent => "No Content",
            HttpStatusCode::PartialContent => "Partial Content",
            HttpStatusCode::MovedPermanently => "Moved Permanently",
            HttpStatusCode::Found => "Found",
            HttpStatusCode::NotModified => "Not Modified",
            HttpStatusCode::TemporaryRedirect => "Temporary Redirect",
            HttpStatusCode::BadRequest => "Bad Request",
            HttpStatusCode::Unauthorized => "Unauthorized",
            HttpStatusCode::Forbidden => "Forbidden",
            HttpStatusCode::NotFound => "Not Found",
            HttpStatusCode::MethodNotAllowed => "Method Not Allowed",
            HttpStatusCode::RequestTimeout => "Request Timeout",
            HttpStatusCode::LengthRequired => "Length Required",
            HttpStatusCode::PayloadTooLarge => "Payload Too Large",
            HttpStatusCode::InternalServerError => "Internal Server Error",
            HttpStatusCode::NotImplemented => "Not Implemented",
            HttpStatusCode::BadGateway => "Bad Gateway",
            HttpStatusCode::ServiceUnavailable => "Service Unavailable",
            HttpStatusCode::GatewayTimeout => "Gateway Timeout",
            HttpStatusCode::HttpVersionNotSupported => "HTTP Version Not Supported",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    status_code: HttpStatusCode,
    close_connection: bool,
    headers: Headers,
    body: Vec<u8>,
    stream_id: u32,
}

impl Default for HttpResponse {
    fn default() -> Self {
        HttpResponse::new()
    }
}

impl HttpResponse {
    pub fn new() -> HttpResponse {
        HttpResponse {
            status_code: HttpStatusCode::Ok,
            close_connection: false,
            headers: Headers::new(),
            body: Vec::new(),
            stream_id: 0,
        }
    }

    pub fn status_code(&self) -> HttpStatusCode {
        self.status_code
    }

    pub fn set_status_code(&mut self, code: HttpStatusCode) {
        self.status_code = code;
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn set_close_connection(&mut self, close: bool) {
        self.close_connection = close;
    }

    pub fn add_header(&mut self, field: &str, value: &str) {
        self.headers.add(field, value);
    }

    pub fn set_header(&mut self, field: &str, value: &str) {
        self.headers.set(field, value);
    }

    pub fn header(&self, field: &str) -> Option<&str> {
        self.headers.get(field)
    }

    pub fn has_header(&self, field: &str) -> bool {
        self.headers.contains(field)
    }

    pub fn remove_header(&mut self, field: &str) {
        self.headers.remove(field);
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        self.ensure_content_length();
    }

    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
        self.ensure_content_length();
    }

    pub fn clear_body(&mut self) {
        self.body.clear();
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header("content-type", content_type);
    }

    pub fn set_json_content_type(&mut self) {
        self.set_content_type("application/json; charset=utf-8");
    }

    pub fn set_html_content_type(&mut self) {
        self.set_content_type("text/html; charset=utf-8");
    }

    pub fn set_text_content_type(&mut self) {
        self.set_content_type("text/plain; charset=utf-8");
    }

    pub fn redirect(&mut self, url: &str, code: HttpStatusCode) {
        self.set_status_code(code);
        self.set_header("location", url);
        self.set_html_content_type();
        self.set_body(format!(
            "<html><body><h1>Redirecting...</h1><p>Please follow <a href=\"{}\">this link</a>.</p></body></html>",
            url
        ));
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn set_stream_id(&mut self, stream_id: u32) {
        self.stream_id = stream_id;
    }

    pub fn reset(&mut self) {
        *self = HttpResponse::new();
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        self.append_to_buffer(&mut buffer);
        buffer
    }

    /// Serialize in wire order: status line, application headers, then
    /// the synthesized connection/server/date headers for whichever the
    /// application left unset, blank line, body.
    pub fn append_to_buffer(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(b"HTTP/1.1 ");
        buffer.extend_from_slice(self.status_code.as_u16().to_string().as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(self.status_code.reason().as_bytes());
        buffer.extend_from_slice(b"\r\n");

        for (field, value) in self.headers.iter() {
            buffer.extend_from_slice(field.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        if !self.headers.contains("connection") {
            if self.close_connection {
                buffer.extend_from_slice(b"connection: close\r\n");
            } else {
                buffer.extend_from_slice(b"connection: keep-alive\r\n");
            }
        }

        if !self.headers.contains("server") {
            buffer.extend_from_slice(b"server: TZZeroHTTP/1.0\r\n");
        }

        if !self.headers.contains("date") {
            buffer.extend_from_slice(b"date: ");
            buffer.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        buffer.extend_from_slice(b"\r\n");
        buffer.extend_from_slice(&self.body);
    }

    fn ensure_content_length(&mut self) {
        if !self.body.is_empty() && !self.headers.contains("content-length") {
            self.headers
                .set("content-length", &self.body.len().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_string(response: &HttpResponse) -> String {
        String::from_utf8_lossy(&response.to_bytes()).into_owned()
    }

    #[test]
    fn serialization_order_and_synthesized_headers() {
        let mut response = HttpResponse::new();
        response.set_status_code(HttpStatusCode::Ok);
        response.set_content_type("text/html");
        response.set_body("<html/>");

        let wire = wire_string(&response);
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("content-type: text/html\r\n"));
        assert!(wire.contains("content-length: 7\r\n"));
        assert!(wire.contains("connection: keep-alive\r\n"));
        assert!(wire.contains("server: TZZeroHTTP/1.0\r\n"));
        assert!(wire.contains("date: "));
        assert!(wire.ends_with("\r\n\r\n<html/>"));
    }

    #[test]
    fn close_connection_synthesizes_close_header() {
        let mut response = HttpResponse::new();
        response.set_close_connection(true);
        let wire = wire_string(&response);
        assert!(wire.contains("connection: close\r\n"));
        assert!(!wire.contains("connection: keep-alive"));
    }

    #[test]
    fn application_connection_header_is_not_duplicated() {
        let mut response = HttpResponse::new();
        response.set_header("Connection", "keep-alive");
        let wire = wire_string(&response);
        assert_eq!(wire.matches("connection:").count(), 1);
    }

    #[test]
    fn explicit_server_header_wins() {
        let mut response = HttpResponse::new();
        response.set_header("Server", "custom/2");
        let wire = wire_string(&response);
        assert!(wire.contains("server: custom/2\r\n"));
        assert!(!wire.contains("TZZeroHTTP"));
    }

    #[test]
    fn set_body_synthesizes_content_length_once() {
        let mut response = HttpResponse::new();
        response.set_header("content-length", "999");
        response.set_body("abc");
        assert_eq!(response.header("content-length"), Some("999"));

        let mut response = HttpResponse::new();
        response.set_body("abc");
        assert_eq!(response.header("content-length"), Some("3"));
    }

    #[test]
    fn redirect_sets_location_and_body() {
        let mut response = HttpResponse::new();
        response.redirect("/new", HttpStatusCode::Found);
        assert_eq!(response.status_code(), HttpStatusCode::Found);
        assert_eq!(response.header("location"), Some("/new"));
        let wire = wire_string(&response);
        assert!(wire.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(wire.contains("/new"));
    }

    #[test]
    fn status_reasons() {
        assert_eq!(HttpStatusCode::NotFound.reason(), "Not Found");
        assert_eq!(HttpStatusCode::NotFound.as_u16(), 404);
        assert_eq!(
            HttpStatusCode::InternalServerError.reason(),
            "Internal Server Error"
        );
    }
}

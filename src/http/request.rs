//! HTTP request model: typed method and version, a case-insensitive
//! header map, body storage and the incremental parse state.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Invalid,
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Connect,
    Trace,
}

impl HttpMethod {
    pub fn from_str(method: &str) -> HttpMethod {
        match method {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            "PATCH" => HttpMethod::Patch,
            "CONNECT" => HttpMethod::Connect,
            "TRACE" => HttpMethod::Trace,
            _ => HttpMethod::Invalid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Invalid => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Unknown,
    Http10,
    Http11,
    Http20,
}

impl HttpVersion {
    /// Strict byte-exact match; case variants and padding are UNKNOWN.
    pub fn from_str(version: &str) -> HttpVersion {
        match version {
            "HTTP/1.0" => HttpVersion::Http10,
            "HTTP/1.1" => HttpVersion::Http11,
            "HTTP/2.0" => HttpVersion::Http20,
            _ => HttpVersion::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Http20 => "HTTP/2.0",
            HttpVersion::Unknown => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Complete,
    Error,
}

/// Field names are lowercased at insert and lookup; a duplicate `add`
/// appends to the existing value joined by `", "`.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    map: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn add(&mut self, field: &str, value: &str) {
        self.map
            .entry(field.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    pub fn set(&mut self, field: &str, value: &str) {
        self.map.insert(field.to_ascii_lowercase(), value.to_string());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.map.get(&field.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.map.contains_key(&field.to_ascii_lowercase())
    }

    pub fn remove(&mut self, field: &str) {
        self.map.remove(&field.to_ascii_lowercase());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: HttpMethod,
    path: String,
    query: String,
    version: HttpVersion,
    headers: Headers,
    body: Vec<u8>,
    parse_state: ParseState,
    // Reserved for the HTTP/2 hooks; the HTTP/1.x core never sets it.
    stream_id: u32,
}

impl Default for HttpRequest {
    fn default() -> Self {
        HttpRequest::new()
    }
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Invalid,
            path: String::new(),
            query: String::new(),
            version: HttpVersion::Unknown,
            headers: Headers::new(),
            body: Vec::new(),
            parse_state: ParseState::RequestLine,
            stream_id: 0,
        }
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn set_method(&mut self, method: HttpMethod) {
        self.method = method;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    /// Raw query string after the `?`; not parsed further.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn set_query(&mut self, query: &str) {
        self.query = query.to_string();
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn set_version(&mut self, version: HttpVersion) {
        self.version = version;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, field: &str) -> Option<&str> {
        self.headers.get(field)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// `Content-Length` as a non-negative integer; anything unparsable
    /// counts as zero (no body).
    pub fn content_length(&self) -> usize {
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0)
    }

    /// HTTP/1.1 keeps the connection unless `Connection: close`;
    /// HTTP/1.0 closes unless `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .headers
            .get("connection")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();

        if self.version == HttpVersion::Http11 {
            connection != "close"
        } else {
            connection == "keep-alive"
        }
    }

    pub fn parse_state(&self) -> ParseState {
        self.parse_state
    }

    pub fn set_parse_state(&mut self, state: ParseState) {
        self.parse_state = state;
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn set_stream_id(&mut self, stream_id: u32) {
        self.stream_id = stream_id;
    }

    pub fn reset(&mut self) {
        *self = HttpRequest::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Foo", "1");
        assert_eq!(headers.get("foo"), Some("1"));
        assert_eq!(headers.get("FOO"), Some("1"));
        assert!(headers.contains("fOo"));
    }

    #[test]
    fn duplicate_add_joins_values() {
        let mut headers = Headers::new();
        headers.add("Foo", "1");
        headers.add("foo", "2");
        assert_eq!(headers.get("Foo"), Some("1, 2"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn set_replaces_value() {
        let mut headers = Headers::new();
        headers.add("Foo", "1");
        headers.set("FOO", "2");
        assert_eq!(headers.get("foo"), Some("2"));
    }

    #[test]
    fn method_roundtrip() {
        assert_eq!(HttpMethod::from_str("GET"), HttpMethod::Get);
        assert_eq!(HttpMethod::from_str("DELETE"), HttpMethod::Delete);
        assert_eq!(HttpMethod::from_str("get"), HttpMethod::Invalid);
        assert_eq!(HttpMethod::Get.as_str(), "GET");
    }

    #[test]
    fn version_match_is_strict() {
        assert_eq!(HttpVersion::from_str("HTTP/1.1"), HttpVersion::Http11);
        assert_eq!(HttpVersion::from_str("http/1.1"), HttpVersion::Unknown);
        assert_eq!(HttpVersion::from_str("HTTP/1.1 "), HttpVersion::Unknown);
    }

    #[test]
    fn keep_alive_policy_per_version() {
        let mut req = HttpRequest::new();
        req.set_version(HttpVersion::Http11);
        assert!(req.keep_alive());
        req.headers_mut().set("connection", "close");
        assert!(!req.keep_alive());

        let mut req = HttpRequest::new();
        req.set_version(HttpVersion::Http10);
        assert!(!req.keep_alive());
        req.headers_mut().set("connection", "Keep-Alive");
        assert!(req.keep_alive());
    }

    #[test]
    fn content_length_parse_failure_is_zero() {
        let mut req = HttpRequest::new();
        req.headers_mut().set("content-length", "18");
        assert_eq!(req.content_length(), 18);
        req.headers_mut().set("content-length", "banana");
        assert_eq!(req.content_length(), 0);
        req.headers_mut().set("content-length", "-4");
        assert_eq!(req.content_length(), 0);
    }
}

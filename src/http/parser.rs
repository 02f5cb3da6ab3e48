//! Streaming HTTP/1.x request parser.
//!
//! Consumes bytes from a connection's input buffer and advances an
//! explicit state machine, tolerating reads fragmented at arbitrary byte
//! boundaries. The parser owns the request being assembled so partial
//! state survives across message callbacks; one parser lives per
//! connection and is reset between keep-alive requests.

use crate::buffer::Buffer;
use crate::http::request::{HttpMethod, HttpRequest, HttpVersion, ParseState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    BadRequestLine,
    BadMethod,
    BadVersion,
    BadHeader,
    BadEncoding,
}

pub struct HttpParser {
    request: HttpRequest,
    error: Option<ParseError>,
    content_length: usize,
}

impl Default for HttpParser {
    fn default() -> Self {
        HttpParser::new()
    }
}

impl HttpParser {
    pub fn new() -> HttpParser {
        HttpParser {
            request: HttpRequest::new(),
            error: None,
            content_length: 0,
        }
    }

    /// Feed the parser from `buffer`. Returns `true` once one full
    /// request has been parsed; `false` means more data is needed or an
    /// error was recorded (check `has_error`).
    pub fn parse(&mut self, buffer: &mut Buffer) -> bool {
        loop {
            match self.request.parse_state() {
                ParseState::RequestLine => {
                    let Some(pos) = buffer.find_crlf() else {
                        return false; // need more data
                    };
                    let line = buffer.retrieve_as_bytes(pos);
                    buffer.retrieve(2);

                    let line = match std::str::from_utf8(&line) {
                        Ok(line) => line.to_string(),
                        Err(_) => return self.fail(ParseError::BadEncoding),
                    };
                    if let Err(e) = self.parse_request_line(&line) {
                        return self.fail(e);
                    }
                    self.request.set_parse_state(ParseState::Headers);
                }
                ParseState::Headers => {
                    let Some(pos) = buffer.find_crlf() else {
                        return false;
                    };
                    let line = buffer.retrieve_as_bytes(pos);
                    buffer.retrieve(2);

                    if line.is_empty() {
                        // Blank line ends the header block.
                        self.content_length = self.request.content_length();
                        if self.content_length > 0 {
                            self.request.set_parse_state(ParseState::Body);
                        } else {
                            self.request.set_parse_state(ParseState::Complete);
                            return true;
                        }
                    } else {
                        let line = match std::str::from_utf8(&line) {
                            Ok(line) => line.to_string(),
                            Err(_) => return self.fail(ParseError::BadEncoding),
                        };
                        if let Err(e) = self.parse_header_line(&line) {
                            return self.fail(e);
                        }
                    }
                }
                ParseState::Body => {
                    if buffer.readable_bytes() < self.content_length {
                        return false; // need more data
                    }
                    let body = buffer.retrieve_as_bytes(self.content_length);
                    self.request.set_body(body);
                    self.request.set_parse_state(ParseState::Complete);
                    return true;
                }
                ParseState::Complete => return true,
                ParseState::Error => return false,
            }
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<ParseError> {
        self.error
    }

    /// Hand over the completed request, leaving the parser ready for the
    /// next one.
    pub fn take_request(&mut self) -> HttpRequest {
        self.content_length = 0;
        std::mem::take(&mut self.request)
    }

    pub fn reset(&mut self) {
        self.request.reset();
        self.error = None;
        self.content_length = 0;
    }

    fn fail(&mut self, error: ParseError) -> bool {
        self.error = Some(error);
        self.request.set_parse_state(ParseState::Error);
        false
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split_whitespace();
        let method_str = parts.next().ok_or(ParseError::BadRequestLine)?;
        let target = parts.next().ok_or(ParseError::BadRequestLine)?;
        let version_str = parts.next().ok_or(ParseError::BadRequestLine)?;

        let method = HttpMethod::from_str(method_str);
        if method == HttpMethod::Invalid {
            return Err(ParseError::BadMethod);
        }
        self.request.set_method(method);

        match target.find('?') {
            Some(pos) => {
                self.request.set_path(&target[..pos]);
                self.request.set_query(&target[pos + 1..]);
            }
            None => self.request.set_path(target),
        }

        let version = HttpVersion::from_str(version_str);
        if version == HttpVersion::Unknown {
            return Err(ParseError::BadVersion);
        }
        self.request.set_version(version);

        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<(), ParseError> {
        let colon = line.find(':').ok_or(ParseError::BadHeader)?;
        let field = line[..colon].trim();
        let value = line[colon + 1..].trim();

        if field.is_empty() {
            return Err(ParseError::BadHeader);
        }

        self.request.headers_mut().add(field, value);
        Ok(())
    }
}

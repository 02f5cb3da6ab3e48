//! HTTP/1.x protocol layer: request/response model, streaming parser and
//! the server facade.

pub mod parser;
pub mod request;
pub mod response;
pub mod server;

pub use parser::{HttpParser, ParseError};
pub use request::{Headers, HttpMethod, HttpRequest, HttpVersion, ParseState};
pub use response::{HttpResponse, HttpStatusCode};
pub use server::{HttpCallback, HttpServer};

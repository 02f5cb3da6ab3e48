use crate::http::parser::ParseError;
use std::io;

/// Central error type for the tzzero core.
#[derive(Debug)]
pub enum TzzeroError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Error during HTTP request parsing.
    Parse(ParseError),
    /// A second event loop was constructed on a thread that already owns one.
    LoopExists,
    /// A worker thread died before publishing its event loop.
    WorkerStartup(String),
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for TzzeroError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TzzeroError::Io(e) => write!(f, "I/O error: {}", e),
            TzzeroError::Parse(e) => write!(f, "Parse error: {:?}", e),
            TzzeroError::LoopExists => write!(f, "Another EventLoop exists in this thread"),
            TzzeroError::WorkerStartup(msg) => write!(f, "Worker startup failed: {}", msg),
            TzzeroError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for TzzeroError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TzzeroError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TzzeroError {
    fn from(e: io::Error) -> Self {
        TzzeroError::Io(e)
    }
}

impl From<ParseError> for TzzeroError {
    fn from(e: ParseError) -> Self {
        TzzeroError::Parse(e)
    }
}

pub type TzzeroResult<T> = Result<T, TzzeroError>;

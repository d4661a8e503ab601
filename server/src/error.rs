use std::fmt;
use std::io;

/// Errors surfaced by the server runtime.
#[derive(Debug)]
pub enum ServerError {
    /// Socket setup or teardown failed.
    Io(io::Error),
    /// The completion ring reported an error.
    Ring(io_ring::Error),
    /// Request head could not be parsed.
    Parse(protocol_http::ParseError),
    /// A second status line was attempted on one transaction.
    ResponseAlreadyWritten,
    /// The stream was closed under the writer.
    StreamClosed,
    /// No listeners configured.
    NoListeners,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
            ServerError::Ring(e) => write!(f, "ring error: {e}"),
            ServerError::Parse(e) => write!(f, "parse error: {e}"),
            ServerError::ResponseAlreadyWritten => write!(f, "response already written"),
            ServerError::StreamClosed => write!(f, "stream closed"),
            ServerError::NoListeners => write!(f, "no listeners configured"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            ServerError::Ring(e) => Some(e),
            ServerError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<io_ring::Error> for ServerError {
    fn from(e: io_ring::Error) -> Self {
        ServerError::Ring(e)
    }
}

impl From<protocol_http::ParseError> for ServerError {
    fn from(e: protocol_http::ParseError) -> Self {
        ServerError::Parse(e)
    }
}

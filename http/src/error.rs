use thiserror::Error;

/// Request parse failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed framing: bad request line, bad header line, oversized
    /// line, invalid chunk size.
    #[error("malformed request")]
    Unspecified,
    /// The request line named an HTTP version this server does not speak.
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
}

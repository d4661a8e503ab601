use std::fmt;
use std::io;

/// Errors returned by the ring.
#[derive(Debug)]
pub enum Error {
    /// Backend setup or syscall failed.
    Io(io::Error),
    /// No room left in the submission queue. The caller should reap
    /// completions (or wait for the dispatcher to) and retry.
    SubmissionQueueFull,
    /// The requested backend is not available on this system.
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::SubmissionQueueFull => write!(f, "submission queue full"),
            Error::Unsupported(what) => write!(f, "backend unsupported: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

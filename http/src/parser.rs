//! Incremental HTTP/1.x request-head parser.
//!
//! The parser is fed arbitrary byte chunks as they come off the socket.
//! Partial lines are buffered internally; when the empty line ends the
//! header block the caller learns how many bytes of the last chunk were
//! consumed, and pushes the remainder (body or a pipelined request) back
//! onto its input queue.

use crate::error::ParseError;
use crate::header::{HeaderName, Headers};
use crate::method::Method;
use crate::request::Request;
use crate::version::Version;

/// Upper bound on a single request or header line.
const MAX_LINE: usize = 8 * 1024;

/// Result of one [`RequestParser::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feed {
    /// Bytes of the chunk consumed by the parser.
    pub consumed: usize,
    /// True once the header block is terminated; the head can be taken
    /// with [`RequestParser::take_request`].
    pub complete: bool,
}

enum State {
    RequestLine,
    Headers,
    Complete,
}

pub struct RequestParser {
    state: State,
    line: Vec<u8>,
    method: Method,
    path: String,
    version: Version,
    headers: Headers,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: State::RequestLine,
            line: Vec::with_capacity(128),
            method: Method::Get,
            path: String::new(),
            version: Version::Http11,
            headers: Headers::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    /// Consume bytes from `chunk`. Stops early once the head is
    /// complete; the caller owns whatever was not consumed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Feed, ParseError> {
        let mut offset = 0;
        while offset < chunk.len() {
            if matches!(self.state, State::Complete) {
                break;
            }

            let Some(nl) = chunk[offset..].iter().position(|&b| b == b'\n') else {
                // No line end in this chunk; buffer and wait for more.
                self.line.extend_from_slice(&chunk[offset..]);
                if self.line.len() > MAX_LINE {
                    return Err(ParseError::Unspecified);
                }
                offset = chunk.len();
                break;
            };

            self.line.extend_from_slice(&chunk[offset..offset + nl]);
            offset += nl + 1;
            if self.line.len() > MAX_LINE {
                return Err(ParseError::Unspecified);
            }
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }

            let line = std::mem::take(&mut self.line);
            self.process_line(&line)?;
        }

        Ok(Feed {
            consumed: offset,
            complete: self.is_complete(),
        })
    }

    /// Take the parsed head and reset for the next request on the same
    /// connection.
    pub fn take_request(&mut self) -> Request {
        debug_assert!(self.is_complete(), "request head not complete");
        let request = Request {
            method: std::mem::replace(&mut self.method, Method::Get),
            path: std::mem::take(&mut self.path),
            version: self.version,
            headers: std::mem::take(&mut self.headers),
        };
        self.state = State::RequestLine;
        self.version = Version::Http11;
        request
    }

    fn process_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        match self.state {
            State::RequestLine => {
                if line.is_empty() {
                    // Tolerate blank lines ahead of the request line.
                    return Ok(());
                }
                self.parse_request_line(line)?;
                self.state = State::Headers;
                Ok(())
            }
            State::Headers => {
                if line.is_empty() {
                    self.state = State::Complete;
                    return Ok(());
                }
                self.parse_header_line(line)
            }
            State::Complete => Ok(()),
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        // Simple request form: a bare path implies GET over HTTP/1.0.
        if line[0] == b'/' {
            self.method = Method::Get;
            self.path = String::from_utf8_lossy(line).into_owned();
            self.version = Version::Http10;
            return Ok(());
        }

        let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
        let method = parts.next().ok_or(ParseError::Unspecified)?;
        let path = parts.next().ok_or(ParseError::Unspecified)?;
        let version = parts.next().ok_or(ParseError::Unspecified)?;
        if parts.next().is_some() {
            return Err(ParseError::Unspecified);
        }

        self.version = match version {
            b"HTTP/1.0" => Version::Http10,
            b"HTTP/1.1" => Version::Http11,
            v if v.starts_with(b"HTTP/") => return Err(ParseError::UnsupportedVersion),
            _ => return Err(ParseError::Unspecified),
        };
        self.method = Method::from_bytes(method);
        self.path = String::from_utf8_lossy(path).into_owned();
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::Unspecified)?;
        if colon == 0 {
            return Err(ParseError::Unspecified);
        }
        let name = HeaderName::from_bytes(&line[..colon]);
        let value = String::from_utf8_lossy(&line[colon + 1..]);
        self.headers.append(name, value.trim().to_string());
        Ok(())
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> (Request, usize) {
        let mut parser = RequestParser::new();
        let feed = parser.feed(input).unwrap();
        assert!(feed.complete, "head not complete");
        (parser.take_request(), feed.consumed)
    }

    #[test]
    fn simple_get() {
        let (req, consumed) = parse_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.header("host"), Some("x"));
        assert_eq!(consumed, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".len());
    }

    #[test]
    fn stops_at_body() {
        let input = b"POST /p HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody";
        let (req, consumed) = parse_all(input);
        assert_eq!(req.method, Method::Post);
        assert_eq!(consumed, input.len() - 4, "body bytes left unconsumed");
    }

    #[test]
    fn split_across_chunks() {
        let mut parser = RequestParser::new();
        let feed = parser.feed(b"GET /long/pa").unwrap();
        assert!(!feed.complete);
        assert_eq!(feed.consumed, b"GET /long/pa".len());

        let feed = parser.feed(b"th HTTP/1.1\r\nHo").unwrap();
        assert!(!feed.complete);

        let feed = parser.feed(b"st: example\r\n\r\n").unwrap();
        assert!(feed.complete);

        let req = parser.take_request();
        assert_eq!(req.path, "/long/path");
        assert_eq!(req.header("Host"), Some("example"));
    }

    #[test]
    fn value_whitespace_is_trimmed() {
        let (req, _) = parse_all(b"GET / HTTP/1.1\r\nX-Pad:   padded value   \r\n\r\n");
        assert_eq!(req.header("x-pad"), Some("padded value"));
    }

    #[test]
    fn bare_path_is_simple_http10_request() {
        let (req, _) = parse_all(b"/index.html\r\n\r\n");
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.version, Version::Http10);
    }

    #[test]
    fn lf_only_lines_accepted() {
        let (req, _) = parse_all(b"GET / HTTP/1.0\nHost: y\n\n");
        assert_eq!(req.version, Version::Http10);
        assert_eq!(req.header("host"), Some("y"));
    }

    #[test]
    fn unknown_minor_version_rejected() {
        let mut parser = RequestParser::new();
        let err = parser.feed(b"GET / HTTP/1.7\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::UnsupportedVersion);
    }

    #[test]
    fn http2_preface_rejected() {
        let mut parser = RequestParser::new();
        let err = parser.feed(b"PRI * HTTP/2.0\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::UnsupportedVersion);
    }

    #[test]
    fn malformed_request_line_rejected() {
        let mut parser = RequestParser::new();
        let err = parser.feed(b"COMPLETE GARBAGE\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::Unspecified);
    }

    #[test]
    fn header_without_colon_rejected() {
        let mut parser = RequestParser::new();
        let err = parser.feed(b"GET / HTTP/1.1\r\nbogus line\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::Unspecified);
    }

    #[test]
    fn oversized_line_rejected() {
        let mut parser = RequestParser::new();
        let long = vec![b'a'; 9 * 1024];
        let err = parser.feed(&long).unwrap_err();
        assert_eq!(err, ParseError::Unspecified);
    }

    #[test]
    fn parser_reusable_after_take() {
        let mut parser = RequestParser::new();
        parser.feed(b"GET /first HTTP/1.1\r\n\r\n").unwrap();
        let first = parser.take_request();
        assert_eq!(first.path, "/first");

        parser.feed(b"GET /second HTTP/1.1\r\n\r\n").unwrap();
        let second = parser.take_request();
        assert_eq!(second.path, "/second");
    }

    // Round-trip: serialising a head and re-parsing it yields the same
    // fields.
    #[test]
    fn round_trip() {
        let wire = format!(
            "{} {} {}\r\n{}: {}\r\n{}: {}\r\n\r\n",
            "PUT", "/res/1", "HTTP/1.1", "Content-Type", "text/plain", "X-Custom", "7"
        );
        let (req, _) = parse_all(wire.as_bytes());
        assert_eq!(req.method, Method::Put);
        assert_eq!(req.path, "/res/1");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.header("x-custom"), Some("7"));
    }
}

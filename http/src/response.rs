use bytes::BytesMut;

use crate::header::{HeaderName, Headers};
use crate::status::StatusCode;
use crate::version::Version;

/// Literal response for requests this server could not parse. The body
/// is fixed so Content-Length can be too.
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Type: text/html\r\n\
Content-Length: 65\r\n\
Connection: close\r\n\
\r\n\
<!DOCTYPE html><html><body><h1>400 Bad Request</h1></body></html>";

/// A response head under construction.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
}

impl Response {
    /// Responses start as 500 so a handler that forgets to set a status
    /// reports its own failure rather than a false success.
    pub fn new() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: Headers::new(),
        }
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn header(&mut self, name: HeaderName, value: impl Into<String>) -> &mut Self {
        self.headers.append(name, value);
        self
    }

    /// Serialise status line and headers, terminated by the empty line.
    pub fn serialize_into(&self, version: Version, dst: &mut BytesMut) {
        dst.extend_from_slice(version.as_str().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(self.status.as_u16().to_string().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(self.status.canonical_reason().as_bytes());
        dst.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            dst.extend_from_slice(name.as_str().as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(value.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        dst.extend_from_slice(b"\r\n");
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_status_line_and_headers() {
        let mut response = Response::new();
        response.set_status(StatusCode::OK);
        response.header(HeaderName::from_static("Content-Type"), "text/plain");
        response.header(HeaderName::from_static("Content-Length"), "5");

        let mut buf = BytesMut::new();
        response.serialize_into(Version::Http11, &mut buf);
        assert_eq!(
            &buf[..],
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\n"
                .as_slice()
        );
    }

    #[test]
    fn default_status_is_500() {
        assert_eq!(Response::new().status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn bad_request_content_length_matches_body() {
        let text = std::str::from_utf8(BAD_REQUEST).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        let declared: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, body.len());
    }
}

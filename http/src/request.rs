use crate::encoding::accepts_encoding;
use crate::header::Headers;
use crate::method::Method;
use crate::version::Version;

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub headers: Headers,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Whether the connection should stay open after this exchange.
    /// `Connection: close` always wins; keep-alive is the 1.1 default
    /// and must be explicit on 1.0.
    pub fn wants_keep_alive(&self) -> bool {
        match self.headers.get("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version.default_keep_alive(),
        }
    }

    /// Declared body length, if framed by Content-Length.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the body is framed by chunked transfer coding. When both
    /// framings are present, chunked takes precedence.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("Transfer-Encoding")
            .map(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    /// Whether the client advertised support for the given content
    /// coding in Accept-Encoding.
    pub fn accepts_encoding(&self, coding: &str) -> bool {
        self.headers
            .get("Accept-Encoding")
            .map(|v| accepts_encoding(v, coding))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderName;

    fn request_with(version: Version, headers: &[(&'static str, &str)]) -> Request {
        let mut h = Headers::new();
        for (name, value) in headers {
            h.append(HeaderName::from_static(name), *value);
        }
        Request {
            method: Method::Get,
            path: "/".to_string(),
            version,
            headers: h,
        }
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        assert!(request_with(Version::Http11, &[]).wants_keep_alive());
        assert!(!request_with(Version::Http10, &[]).wants_keep_alive());
    }

    #[test]
    fn connection_header_overrides() {
        assert!(!request_with(Version::Http11, &[("Connection", "close")]).wants_keep_alive());
        assert!(request_with(Version::Http10, &[("Connection", "keep-alive")]).wants_keep_alive());
    }

    #[test]
    fn chunked_detection() {
        assert!(request_with(Version::Http11, &[("Transfer-Encoding", "gzip, chunked")]).is_chunked());
        assert!(!request_with(Version::Http11, &[("Content-Length", "10")]).is_chunked());
    }

    #[test]
    fn content_length_parse() {
        assert_eq!(
            request_with(Version::Http11, &[("Content-Length", "42")]).content_length(),
            Some(42)
        );
        assert_eq!(request_with(Version::Http11, &[]).content_length(), None);
    }
}

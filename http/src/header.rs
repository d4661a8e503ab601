//! Header names and ordered header lists.

/// Well-known header names kept as static strings; parsing one of these
/// does not copy. Comparison is case-insensitive either way.
const WELL_KNOWN: &[&str] = &[
    "Accept",
    "Accept-Encoding",
    "Connection",
    "Content-Encoding",
    "Content-Length",
    "Content-Type",
    "Cookie",
    "Date",
    "Host",
    "Keep-Alive",
    "Location",
    "Server",
    "Set-Cookie",
    "Transfer-Encoding",
    "User-Agent",
    "Vary",
];

#[derive(Debug, Clone)]
pub enum HeaderName {
    Standard(&'static str),
    Custom(Box<str>),
}

impl HeaderName {
    pub fn from_bytes(bytes: &[u8]) -> HeaderName {
        for name in WELL_KNOWN {
            if bytes.eq_ignore_ascii_case(name.as_bytes()) {
                return HeaderName::Standard(name);
            }
        }
        HeaderName::Custom(String::from_utf8_lossy(bytes).into())
    }

    pub fn from_static(name: &'static str) -> HeaderName {
        HeaderName::Standard(name)
    }

    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Standard(s) => s,
            HeaderName::Custom(s) => s,
        }
    }
}

impl PartialEq for HeaderName {
    fn eq(&self, other: &Self) -> bool {
        self.as_str().eq_ignore_ascii_case(other.as_str())
    }
}

impl Eq for HeaderName {}

impl PartialEq<&str> for HeaderName {
    fn eq(&self, other: &&str) -> bool {
        self.as_str().eq_ignore_ascii_case(other)
    }
}

impl std::fmt::Display for HeaderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered list of header fields. Order and duplicates are preserved
/// (`Set-Cookie` legitimately repeats).
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(HeaderName, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn append(&mut self, name: HeaderName, value: impl Into<String>) {
        self.entries.push((name, value.into()));
    }

    /// Replace the first field with this name, or append.
    pub fn set(&mut self, name: HeaderName, value: impl Into<String>) {
        for (n, v) in self.entries.iter_mut() {
            if *n == name {
                *v = value.into();
                return;
            }
        }
        self.entries.push((name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == &name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All values for one name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n == &name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &str)> {
        self.entries.iter().map(|(n, v)| (n, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_names_are_interned() {
        match HeaderName::from_bytes(b"content-type") {
            HeaderName::Standard(s) => assert_eq!(s, "Content-Type"),
            HeaderName::Custom(_) => panic!("expected interned name"),
        }
    }

    #[test]
    fn custom_names_round_trip() {
        let name = HeaderName::from_bytes(b"X-Request-Id");
        assert_eq!(name.as_str(), "X-Request-Id");
        assert_eq!(name, "x-request-id");
    }

    #[test]
    fn set_replaces_first_match() {
        let mut headers = Headers::new();
        headers.append(HeaderName::from_static("Content-Type"), "text/plain");
        headers.set(HeaderName::from_static("Content-Type"), "application/json");
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn duplicates_preserved() {
        let mut headers = Headers::new();
        headers.append(HeaderName::from_static("Set-Cookie"), "a=1;");
        headers.append(HeaderName::from_static("Set-Cookie"), "b=2;");
        let all: Vec<_> = headers.get_all("set-cookie").collect();
        assert_eq!(all, vec!["a=1;", "b=2;"]);
    }
}

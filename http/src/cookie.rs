//! Set-Cookie serialization.

/// SameSite policy. `Lax` is the browser default and is therefore not
/// written to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

/// One `Set-Cookie` header value under construction.
#[derive(Debug, Clone)]
pub struct SetCookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    secure: bool,
    http_only: bool,
    same_site: SameSite,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            http_only: false,
            same_site: SameSite::Lax,
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    /// Wire form: `name=value;` followed by the attributes that are set.
    pub fn render(&self) -> String {
        let mut out = format!("{}={};", self.name, self.value);
        if let Some(domain) = &self.domain {
            out.push_str(" Domain=");
            out.push_str(domain);
            out.push(';');
        }
        if let Some(path) = &self.path {
            out.push_str(" Path=");
            out.push_str(path);
            out.push(';');
        }
        if self.secure {
            out.push_str(" Secure;");
        }
        if self.http_only {
            out.push_str(" HttpOnly;");
        }
        match self.same_site {
            SameSite::Lax => {}
            SameSite::Strict => out.push_str(" SameSite=Strict;"),
            SameSite::None => out.push_str(" SameSite=None;"),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_cookie() {
        assert_eq!(SetCookie::new("test", "test").render(), "test=test;");
    }

    #[test]
    fn full_attributes() {
        let cookie = SetCookie::new("id", "42")
            .domain("example.com")
            .path("/app")
            .secure()
            .http_only()
            .same_site(SameSite::Strict);
        assert_eq!(
            cookie.render(),
            "id=42; Domain=example.com; Path=/app; Secure; HttpOnly; SameSite=Strict;"
        );
    }

    #[test]
    fn lax_not_emitted() {
        let cookie = SetCookie::new("a", "b").same_site(SameSite::Lax);
        assert_eq!(cookie.render(), "a=b;");
    }
}

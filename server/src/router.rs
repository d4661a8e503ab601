//! Request routing.
//!
//! A router is a list of matchers, each of which either terminates at a
//! handler or descends into a nested group. Path patterns are compiled
//! once into literal and capture tokens; captured arguments reach the
//! handler as a string slice.

use std::sync::Arc;

use protocol_http::StatusCode;
use tracing::debug;

use crate::transaction::Transaction;

/// Boxed handler error; only ever logged.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler signature: the transaction plus captured path arguments.
pub type Handler = dyn Fn(&mut Transaction, &[String]) -> Result<(), HandlerError> + Send + Sync;

/// One compiled path-pattern token.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Literal text that must match exactly.
    Identity(String),
    /// Capture up to (not including) the delimiter, or to the end when
    /// the delimiter is empty.
    MatchUntil(String),
}

/// A precompiled path pattern. `{name}` segments become captures.
#[derive(Debug, Clone)]
pub struct PathPattern {
    tokens: Vec<Token>,
}

impl PathPattern {
    pub fn compile(pattern: &str) -> PathPattern {
        let mut tokens = Vec::new();
        let mut rest = pattern;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                tokens.push(Token::Identity(rest[..open].to_string()));
            }
            let Some(close) = rest[open..].find('}') else {
                // Unbalanced brace: treat the remainder as literal.
                tokens.push(Token::Identity(rest[open..].to_string()));
                rest = "";
                break;
            };
            rest = &rest[open + close + 1..];
            // The capture runs until the next literal's first segment
            // separator, or to the end of the path.
            let delimiter = match rest.chars().next() {
                Some(c) => c.to_string(),
                None => String::new(),
            };
            tokens.push(Token::MatchUntil(delimiter));
        }
        if !rest.is_empty() {
            tokens.push(Token::Identity(rest.to_string()));
        }
        PathPattern { tokens }
    }

    /// Match a request path, returning captured arguments on success.
    pub fn matches(&self, path: &str) -> Option<Vec<String>> {
        let mut args = Vec::new();
        let mut rest = path;
        for token in &self.tokens {
            match token {
                Token::Identity(lit) => {
                    rest = rest.strip_prefix(lit.as_str())?;
                }
                Token::MatchUntil(delim) => {
                    if delim.is_empty() {
                        if rest.is_empty() {
                            return None;
                        }
                        args.push(rest.to_string());
                        rest = "";
                    } else {
                        let end = rest.find(delim.as_str()).unwrap_or(rest.len());
                        if end == 0 {
                            return None;
                        }
                        args.push(rest[..end].to_string());
                        rest = &rest[end..];
                    }
                }
            }
        }
        if rest.is_empty() {
            Some(args)
        } else {
            None
        }
    }
}

/// A routing node: dispatch further or terminate at a handler.
pub enum Matcher {
    /// Match the Host header, then try the inner matcher.
    Host(String, Box<Matcher>),
    /// Match a path pattern and terminate.
    Path(PathPattern, Arc<Handler>),
    /// Terminate unconditionally.
    Always(Arc<Handler>),
    /// Try each inner matcher in order.
    Group(Vec<Matcher>),
}

impl Matcher {
    fn resolve(&self, host: Option<&str>, path: &str) -> Option<(Arc<Handler>, Vec<String>)> {
        match self {
            Matcher::Host(name, inner) => {
                let host = host?;
                // Host may carry a port; compare the name part only.
                let bare = host.split(':').next().unwrap_or(host);
                if bare.eq_ignore_ascii_case(name) {
                    inner.resolve(Some(host), path)
                } else {
                    None
                }
            }
            Matcher::Path(pattern, handler) => pattern
                .matches(path)
                .map(|args| (handler.clone(), args)),
            Matcher::Always(handler) => Some((handler.clone(), Vec::new())),
            Matcher::Group(inner) => inner.iter().find_map(|m| m.resolve(host, path)),
        }
    }
}

/// The routing table handed to every worker.
pub struct Router {
    matchers: Vec<Matcher>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            matchers: Vec::new(),
        }
    }

    /// Terminate `pattern` at `handler`.
    pub fn route(
        mut self,
        pattern: &str,
        handler: impl Fn(&mut Transaction, &[String]) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) -> Router {
        self.matchers.push(Matcher::Path(
            PathPattern::compile(pattern),
            Arc::new(handler),
        ));
        self
    }

    /// Restrict an inner matcher to one Host.
    pub fn host(mut self, name: &str, inner: Matcher) -> Router {
        self.matchers
            .push(Matcher::Host(name.to_string(), Box::new(inner)));
        self
    }

    /// Catch-all handler tried after everything else.
    pub fn fallback(
        mut self,
        handler: impl Fn(&mut Transaction, &[String]) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) -> Router {
        self.matchers.push(Matcher::Always(Arc::new(handler)));
        self
    }

    pub fn matcher(mut self, matcher: Matcher) -> Router {
        self.matchers.push(matcher);
        self
    }

    /// Route a transaction to its handler. Unmatched requests get 404.
    pub(crate) fn dispatch(&self, transaction: &mut Transaction) -> Result<(), HandlerError> {
        let host = transaction.request().header("Host").map(|h| h.to_string());
        // The query string is not part of the route.
        let path = transaction
            .request()
            .path
            .split('?')
            .next()
            .unwrap_or("/")
            .to_string();

        let found = self
            .matchers
            .iter()
            .find_map(|m| m.resolve(host.as_deref(), &path));

        match found {
            Some((handler, args)) => handler(transaction, &args),
            None => {
                debug!(path = %path, "no route matched");
                transaction.reset_response(StatusCode::NOT_FOUND);
                transaction.write_body_no_content()?;
                Ok(())
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

//! protocol-http - HTTP/1.x message types and framing codecs.
//!
//! Everything here is transport-agnostic: an incremental request parser
//! fed arbitrary byte chunks, request/response types with interned
//! method and header names, chunked transfer framing, accept-encoding
//! negotiation and Set-Cookie serialization. The server crate owns the
//! sockets; this crate owns the bytes.

mod chunked;
mod cookie;
mod encoding;
mod error;
mod header;
mod method;
mod parser;
mod request;
mod response;
mod status;
mod version;

pub use chunked::{encode_chunk, encode_last_chunk, ChunkedDecoder};
pub use cookie::{SameSite, SetCookie};
pub use encoding::accepts_encoding;
pub use error::ParseError;
pub use header::{HeaderName, Headers};
pub use method::Method;
pub use parser::{Feed, RequestParser};
pub use request::Request;
pub use response::{Response, BAD_REQUEST};
pub use status::StatusCode;
pub use version::Version;

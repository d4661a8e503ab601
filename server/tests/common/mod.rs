//! Shared plumbing for integration tests: a routing table covering the
//! exercised endpoints and a small wire-level response reader.

use std::io::Read;
use std::time::Duration;

use protocol_http::ChunkedDecoder;
use server::{BodySize, Optimise, Router, SetCookie, StatusCode};

pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Router used by most tests.
pub fn test_router() -> Router {
    Router::new()
        .route("/", |tx, _args| {
            tx.reset_response(StatusCode::OK);
            let mut body = tx.write_body_start(BodySize::Sized(12), "text/plain")?;
            body.write(b"Hello World!")?;
            body.close()?;
            Ok(())
        })
        .route("/infinite", |tx, _args| {
            tx.reset_response(StatusCode::OK);
            let mut body = tx.write_body_start(BodySize::Infinite, "text/plain")?;
            body.write(b"Hello ")?;
            body.flush()?;
            body.write(b"World!")?;
            body.close()?;
            Ok(())
        })
        .route("/compressed", |tx, _args| {
            tx.reset_response(StatusCode::OK);
            let mut body = tx.write_body_start_compressed("text/plain")?;
            body.write(b"Hello World!")?;
            body.close()?;
            Ok(())
        })
        .route("/set-cookie", |tx, _args| {
            tx.reset_response(StatusCode::OK);
            tx.response().header(
                protocol_http::HeaderName::from_static("Set-Cookie"),
                SetCookie::new("test", "test").render(),
            );
            tx.write_body_no_content()?;
            Ok(())
        })
        .route("/set-cookie-many", |tx, _args| {
            tx.reset_response(StatusCode::OK);
            for name in ["test1", "test2"] {
                tx.response().header(
                    protocol_http::HeaderName::from_static("Set-Cookie"),
                    SetCookie::new(name, "test").render(),
                );
            }
            tx.write_body_no_content()?;
            Ok(())
        })
        .route("/echo", |tx, _args| {
            let mut body = Vec::new();
            tx.body_reader(Optimise::Bandwidth).read_to_end(&mut body)?;
            tx.reset_response(StatusCode::OK);
            let mut writer =
                tx.write_body_start(BodySize::Sized(body.len() as u64), "application/octet-stream")?;
            writer.write(&body)?;
            writer.close()?;
            Ok(())
        })
        .route("/args/{name}", |tx, args| {
            let body = args[0].clone().into_bytes();
            tx.reset_response(StatusCode::OK);
            let mut writer =
                tx.write_body_start(BodySize::Sized(body.len() as u64), "text/plain")?;
            writer.write(&body)?;
            writer.close()?;
            Ok(())
        })
}

/// A response as observed on the wire.
#[derive(Debug)]
pub struct WireResponse {
    pub status_line: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Like `Read::read`, but retries on `ErrorKind::Interrupted` instead of
/// surfacing a spurious signal interruption as an I/O error.
fn read_retrying<R: Read>(stream: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match stream.read(buf) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// Read one response, honoring Content-Length or chunked framing; with
/// neither, reads to EOF.
pub fn read_response<R: Read>(stream: &mut R) -> WireResponse {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = read_retrying(stream, &mut tmp).expect("read response head");
        assert!(n > 0, "connection closed before header end");
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("").to_string();
    let status: u16 = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("bad status line: {status_line:?}"));
    let headers: Vec<(String, String)> = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| {
            let (name, value) = l.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    let response = WireResponse {
        status_line,
        status,
        headers,
        body: Vec::new(),
    };

    let mut remainder = buf[head_end..].to_vec();
    let body = if response
        .header("Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        loop {
            let (consumed, done) = decoder.feed(&remainder, &mut out).expect("chunked body");
            remainder.drain(..consumed);
            if done {
                break;
            }
            let n = read_retrying(stream, &mut tmp).expect("read chunked body");
            assert!(n > 0, "connection closed mid chunked body");
            remainder.extend_from_slice(&tmp[..n]);
        }
        out
    } else if let Some(length) = response
        .header("Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        while remainder.len() < length {
            let n = read_retrying(stream, &mut tmp).expect("read sized body");
            assert!(n > 0, "connection closed mid sized body");
            remainder.extend_from_slice(&tmp[..n]);
        }
        remainder.truncate(length);
        remainder
    } else {
        loop {
            match read_retrying(stream, &mut tmp) {
                Ok(0) => break,
                Ok(n) => remainder.extend_from_slice(&tmp[..n]),
                Err(e) => panic!("read to eof: {e}"),
            }
        }
        remainder
    };

    WireResponse { body, ..response }
}

//! One request/response exchange.
//!
//! A transaction owns the parsed request, the response under
//! construction and everything either allocates; dropping the
//! transaction frees it all at once and tells the stream the response
//! is over, which re-arms keep-alive or closes the connection.

use std::sync::Arc;

use protocol_http::{HeaderName, Request, Response, StatusCode};
use tracing::debug;

use crate::body::{BodyReader, BodySize, BodyState, BodyWriter, Optimise};
use crate::error::ServerError;
use crate::stream::Stream;

/// Cap on how many unread body bytes are drained at transaction end;
/// larger leftovers close the connection instead.
const DRAIN_LIMIT: usize = 256 * 1024;

pub struct Transaction {
    stream: Arc<Stream>,
    request: Request,
    response: Response,
    keep_alive: bool,
    keep_alive_timeout: u64,
    response_written: bool,
    body_state: BodyState,
}

impl Transaction {
    pub(crate) fn new(stream: Arc<Stream>, request: Request, keep_alive: bool) -> Transaction {
        let keep_alive_timeout = stream.keep_alive_timeout();
        Transaction {
            stream,
            request,
            response: Response::new(),
            keep_alive,
            keep_alive_timeout,
            response_written: false,
            body_state: BodyState::NotRead,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Install a status code (and its canonical reason). May be called
    /// any number of times before the head is written.
    pub fn reset_response(&mut self, code: StatusCode) -> &mut Response {
        self.response.set_status(code);
        &mut self.response
    }

    /// Serialise status line and headers to the wire. Valid once per
    /// transaction; `Connection` (and the keep-alive advisory) are
    /// filled in here.
    pub fn write_response(&mut self) -> Result<(), ServerError> {
        if self.response_written {
            return Err(ServerError::ResponseAlreadyWritten);
        }
        if self.keep_alive {
            self.response
                .headers
                .set(HeaderName::from_static("Connection"), "keep-alive");
            self.response.headers.set(
                HeaderName::from_static("Keep-Alive"),
                format!("timeout={}", self.keep_alive_timeout),
            );
        } else {
            self.response
                .headers
                .set(HeaderName::from_static("Connection"), "close");
        }
        self.stream
            .write_response(&self.response, self.request.version)?;
        self.response_written = true;
        Ok(())
    }

    /// Write the head and return a body writer in the framing implied
    /// by `size`: Content-Length when known, chunked otherwise.
    pub fn write_body_start(
        &mut self,
        size: BodySize,
        content_type: &str,
    ) -> Result<BodyWriter<'_>, ServerError> {
        self.response
            .headers
            .set(HeaderName::from_static("Content-Type"), content_type);
        match size {
            BodySize::Sized(n) => {
                self.response
                    .headers
                    .set(HeaderName::from_static("Content-Length"), n.to_string());
                self.write_response()?;
                Ok(BodyWriter::sized(&self.stream, n))
            }
            BodySize::Infinite => {
                self.response
                    .headers
                    .set(HeaderName::from_static("Transfer-Encoding"), "chunked");
                self.write_response()?;
                Ok(BodyWriter::chunked(&self.stream))
            }
        }
    }

    /// Like [`write_body_start`](Self::write_body_start) with on-the-fly
    /// gzip, engaged only when the client accepts it; otherwise falls
    /// back to plain chunked output.
    pub fn write_body_start_compressed(
        &mut self,
        content_type: &str,
    ) -> Result<BodyWriter<'_>, ServerError> {
        if !self.request.accepts_encoding("gzip") {
            return self.write_body_start(BodySize::Infinite, content_type);
        }
        self.response
            .headers
            .set(HeaderName::from_static("Content-Type"), content_type);
        self.response
            .headers
            .set(HeaderName::from_static("Content-Encoding"), "gzip");
        self.response
            .headers
            .set(HeaderName::from_static("Vary"), "Accept-Encoding");
        self.response
            .headers
            .set(HeaderName::from_static("Transfer-Encoding"), "chunked");
        self.write_response()?;
        Ok(BodyWriter::gzip(&self.stream))
    }

    /// Headers only, `Content-Length: 0`. No body bytes may follow.
    pub fn write_body_no_content(&mut self) -> Result<(), ServerError> {
        self.response
            .headers
            .set(HeaderName::from_static("Content-Length"), "0");
        self.write_response()
    }

    /// Reader over the request body, framed by Content-Length or
    /// chunked transfer coding (chunked wins when both are present).
    pub fn body_reader(&mut self, optimise: Optimise) -> BodyReader<'_> {
        let stream = self.stream.clone();
        if self.request.is_chunked() {
            BodyReader::chunked(stream, optimise, &mut self.body_state)
        } else if let Some(len) = self.request.content_length() {
            BodyReader::sized(stream, len, optimise, &mut self.body_state)
        } else {
            BodyReader::empty(stream, &mut self.body_state)
        }
    }

    /// Leftover request-body bytes would be parsed as the next request
    /// on a kept-alive connection. An untouched body is drained away
    /// (up to a cap); a half-read one poisons keep-alive.
    fn settle_unread_body(&mut self) {
        let has_body = self.request.is_chunked()
            || self.request.content_length().is_some_and(|n| n > 0);
        if !has_body {
            return;
        }
        match self.body_state {
            BodyState::Done => {}
            BodyState::NotRead => {
                let fully_drained = {
                    let mut reader = self.body_reader(Optimise::Bandwidth);
                    let mut scratch = [0u8; 4096];
                    let mut drained = 0usize;
                    loop {
                        match reader.read(&mut scratch) {
                            Ok(0) => break true,
                            Ok(n) => {
                                drained += n;
                                if drained > DRAIN_LIMIT {
                                    break false;
                                }
                            }
                            Err(_) => break false,
                        }
                    }
                };
                if !fully_drained {
                    self.stream.disable_keep_alive();
                }
            }
            BodyState::Reading => {
                // Framing position is unknown; the connection cannot be
                // reused.
                self.stream.disable_keep_alive();
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // A handler that never wrote anything still owes the client a
        // response; the default head is a 500.
        if !self.response_written {
            if let Err(e) = self.write_body_no_content() {
                debug!(error = %e, "default response write failed");
            }
        }
        self.settle_unread_body();
        if let Err(e) = self.stream.flush() {
            debug!(error = %e, "flush on transaction end failed");
        }
        self.stream.mark_response_end();
    }
}

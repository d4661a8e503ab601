//! Response body writers and request body readers.
//!
//! Writers buffer up to one 64 KiB block and flush on fill or close.
//! Three modes: sized (Content-Length pass-through), chunked framing,
//! and gzip whose compressed output is chunk-framed as it appears.
//! Readers mirror the two framings; the optimisation toggle decides
//! whether a read returns as soon as any bytes exist or keeps pulling
//! until the destination is full.

use std::io::Write;
use std::sync::Arc;

use bytes::BytesMut;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use protocol_http::{encode_chunk, encode_last_chunk, ChunkedDecoder};

use crate::error::ServerError;
use crate::stream::Stream;

/// Buffered block size for body writers.
const WRITE_BLOCK: usize = 64 * 1024;

/// Declared size of an outgoing body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    /// Exact byte count; framed with Content-Length.
    Sized(u64),
    /// Unknown length; framed with chunked transfer coding.
    Infinite,
}

/// Read strategy for request bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Optimise {
    /// Return as soon as any bytes are available.
    #[default]
    Latency,
    /// Keep pulling until the destination buffer is full or the body
    /// ends.
    Bandwidth,
}

enum WriterMode {
    Sized { declared: u64, written: u64 },
    Chunked,
    Gzip(GzEncoder<Vec<u8>>),
}

pub struct BodyWriter<'a> {
    stream: &'a Arc<Stream>,
    mode: WriterMode,
    buf: BytesMut,
    closed: bool,
}

impl<'a> BodyWriter<'a> {
    pub(crate) fn sized(stream: &'a Arc<Stream>, declared: u64) -> Self {
        Self {
            stream,
            mode: WriterMode::Sized {
                declared,
                written: 0,
            },
            buf: BytesMut::with_capacity(WRITE_BLOCK),
            closed: false,
        }
    }

    pub(crate) fn chunked(stream: &'a Arc<Stream>) -> Self {
        Self {
            stream,
            mode: WriterMode::Chunked,
            buf: BytesMut::with_capacity(WRITE_BLOCK),
            closed: false,
        }
    }

    pub(crate) fn gzip(stream: &'a Arc<Stream>) -> Self {
        Self {
            stream,
            mode: WriterMode::Gzip(GzEncoder::new(Vec::new(), Compression::default())),
            buf: BytesMut::new(),
            closed: false,
        }
    }

    /// Append body bytes, flushing whenever a full block accumulates.
    pub fn write(&mut self, data: &[u8]) -> Result<(), ServerError> {
        assert!(!self.closed, "write after body close");
        match &mut self.mode {
            WriterMode::Sized { declared, written } => {
                *written += data.len() as u64;
                debug_assert!(
                    *written <= *declared,
                    "body exceeds declared Content-Length"
                );
                self.buf.extend_from_slice(data);
                if self.buf.len() >= WRITE_BLOCK {
                    let block = self.buf.split();
                    self.stream.write_slice(&block)?;
                }
            }
            WriterMode::Chunked => {
                self.buf.extend_from_slice(data);
                if self.buf.len() >= WRITE_BLOCK {
                    self.flush()?;
                }
            }
            WriterMode::Gzip(encoder) => {
                encoder.write_all(data).map_err(ServerError::Io)?;
                if encoder.get_ref().len() >= WRITE_BLOCK {
                    let compressed = std::mem::take(encoder.get_mut());
                    let mut frame = BytesMut::with_capacity(compressed.len() + 16);
                    encode_chunk(&mut frame, &compressed);
                    self.stream.write_slice(&frame)?;
                }
            }
        }
        Ok(())
    }

    /// Push buffered bytes to the wire without ending the body.
    pub fn flush(&mut self) -> Result<(), ServerError> {
        match &mut self.mode {
            WriterMode::Sized { .. } => {
                if !self.buf.is_empty() {
                    let block = self.buf.split();
                    self.stream.write_slice(&block)?;
                }
            }
            WriterMode::Chunked => {
                if !self.buf.is_empty() {
                    let data = self.buf.split();
                    let mut frame = BytesMut::with_capacity(data.len() + 16);
                    encode_chunk(&mut frame, &data);
                    self.stream.write_slice(&frame)?;
                }
            }
            WriterMode::Gzip(encoder) => {
                encoder.flush().map_err(ServerError::Io)?;
                let compressed = std::mem::take(encoder.get_mut());
                if !compressed.is_empty() {
                    let mut frame = BytesMut::with_capacity(compressed.len() + 16);
                    encode_chunk(&mut frame, &compressed);
                    self.stream.write_slice(&frame)?;
                }
            }
        }
        Ok(())
    }

    /// End the body: flush everything and, for chunked framings, write
    /// the terminating chunk. No body bytes may follow.
    pub fn close(mut self) -> Result<(), ServerError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), ServerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match std::mem::replace(&mut self.mode, WriterMode::Chunked) {
            WriterMode::Sized { declared, written } => {
                if !self.buf.is_empty() {
                    let block = self.buf.split();
                    self.stream.write_slice(&block)?;
                }
                debug_assert_eq!(
                    written, declared,
                    "sized body length mismatch at close"
                );
            }
            WriterMode::Chunked => {
                if !self.buf.is_empty() {
                    let data = self.buf.split();
                    let mut frame = BytesMut::with_capacity(data.len() + 16);
                    encode_chunk(&mut frame, &data);
                    self.stream.write_slice(&frame)?;
                }
                let mut last = BytesMut::with_capacity(8);
                encode_last_chunk(&mut last);
                self.stream.write_slice(&last)?;
            }
            WriterMode::Gzip(encoder) => {
                let compressed = encoder.finish().map_err(ServerError::Io)?;
                let mut frame = BytesMut::with_capacity(compressed.len() + 24);
                encode_chunk(&mut frame, &compressed);
                encode_last_chunk(&mut frame);
                self.stream.write_slice(&frame)?;
            }
        }
        Ok(())
    }
}

impl Drop for BodyWriter<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_inner() {
                debug!(error = %e, "body close on drop failed");
            }
        }
    }
}

/// How much of the request body has been consumed. The transaction
/// uses this at drop time: an untouched body is drained so keep-alive
/// stays usable, a half-read one forces the connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum BodyState {
    #[default]
    NotRead,
    Reading,
    Done,
}

enum ReaderFraming {
    Sized { remaining: u64 },
    Chunked { decoder: ChunkedDecoder, done: bool },
    Empty,
}

pub struct BodyReader<'a> {
    stream: Arc<Stream>,
    framing: ReaderFraming,
    optimise: Optimise,
    state: &'a mut BodyState,
    /// Decoded-but-undelivered bytes (chunked only).
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<'a> BodyReader<'a> {
    pub(crate) fn sized(
        stream: Arc<Stream>,
        len: u64,
        optimise: Optimise,
        state: &'a mut BodyState,
    ) -> Self {
        if len == 0 {
            *state = BodyState::Done;
        }
        Self {
            stream,
            framing: ReaderFraming::Sized { remaining: len },
            optimise,
            state,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub(crate) fn chunked(
        stream: Arc<Stream>,
        optimise: Optimise,
        state: &'a mut BodyState,
    ) -> Self {
        Self {
            stream,
            framing: ReaderFraming::Chunked {
                decoder: ChunkedDecoder::new(),
                done: false,
            },
            optimise,
            state,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub(crate) fn empty(stream: Arc<Stream>, state: &'a mut BodyState) -> Self {
        *state = BodyState::Done;
        Self {
            stream,
            framing: ReaderFraming::Empty,
            optimise: Optimise::Latency,
            state,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Read body bytes into `dst`. Returns 0 at end of body. Blocks
    /// until at least one byte is available (Latency) or the buffer is
    /// full (Bandwidth).
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize, ServerError> {
        match self.optimise {
            Optimise::Latency => self.read_some(dst, true),
            Optimise::Bandwidth => self.read_some(dst, false),
        }
    }

    /// Read the entire remaining body.
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, ServerError> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    fn read_some(&mut self, dst: &mut [u8], stop_early: bool) -> Result<usize, ServerError> {
        if dst.is_empty() {
            return Ok(0);
        }
        if *self.state == BodyState::NotRead {
            *self.state = BodyState::Reading;
        }
        let mut copied = 0;
        loop {
            copied += self.serve_pending(&mut dst[copied..]);
            if self.at_end() {
                *self.state = BodyState::Done;
            }
            if copied == dst.len() || (copied > 0 && stop_early) {
                return Ok(copied);
            }
            if self.at_end() {
                return Ok(copied);
            }

            let Some(slice) = self.stream.read_buffer() else {
                // Peer closed mid-body.
                return if copied > 0 {
                    Ok(copied)
                } else {
                    Err(ServerError::StreamClosed)
                };
            };

            match &mut self.framing {
                ReaderFraming::Sized { remaining } => {
                    let take = (slice.len() as u64).min(*remaining) as usize;
                    self.pending.extend_from_slice(&slice[..take]);
                    *remaining -= take as u64;
                    if take < slice.len() {
                        self.stream.unread(slice.slice(take, slice.len()));
                    }
                }
                ReaderFraming::Chunked { decoder, done } => {
                    let (consumed, finished) = decoder.feed(&slice, &mut self.pending)?;
                    *done = finished;
                    if consumed < slice.len() {
                        self.stream.unread(slice.slice(consumed, slice.len()));
                    }
                }
                ReaderFraming::Empty => unreachable!("empty body never pulls input"),
            }
        }
    }

    fn serve_pending(&mut self, dst: &mut [u8]) -> usize {
        let available = self.pending.len() - self.pending_pos;
        let take = available.min(dst.len());
        if take > 0 {
            dst[..take].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
            self.pending_pos += take;
            if self.pending_pos == self.pending.len() {
                self.pending.clear();
                self.pending_pos = 0;
            }
        }
        take
    }

    fn at_end(&self) -> bool {
        let pending_empty = self.pending_pos == self.pending.len();
        match &self.framing {
            ReaderFraming::Sized { remaining } => pending_empty && *remaining == 0,
            ReaderFraming::Chunked { done, .. } => pending_empty && *done,
            ReaderFraming::Empty => true,
        }
    }
}

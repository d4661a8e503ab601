//! The byte channel inside a session.
//!
//! A stream parses arriving buffers into request heads, queues body
//! bytes for the transaction's reader, and writes the response through
//! its own sub-ring so handler writes never contend with the server's
//! accept/read ring. Sends are synchronous: one SQE, one reaped CQE,
//! which keeps status line and body ordered on the wire.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use io_ring::{RefSlice, Ring, SendResult};
use parklot::{Condvar, Mutex};
use tracing::{debug, trace};

use protocol_http::{ParseError, RequestParser, Response, Version};

use crate::error::ServerError;
use crate::event::ServerEvent;
use crate::session::Session;
use crate::shared::ServerShared;
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamStatus {
    /// No transaction in progress.
    Idle,
    /// A transaction is being handled.
    Open,
    /// Close requested while a transaction is still running.
    HalfClosedLocal,
    /// Peer sent EOF; the response may still be written.
    HalfClosedRemote,
    Closed,
}

struct StreamState {
    status: StreamStatus,
    parser: RequestParser,
    input: VecDeque<RefSlice>,
    in_progress_transaction: bool,
    keep_alive: bool,
    response_written: bool,
    close_posted: bool,
}

pub(crate) struct Stream {
    pub(crate) id: u32,
    fd: RawFd,
    session: Weak<Session>,
    shared: Arc<ServerShared>,
    state: Mutex<StreamState>,
    /// Signaled when input arrives or the stream state changes; body
    /// readers block here.
    update: Condvar,
    sub_ring: Mutex<Ring>,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        fd: RawFd,
        session: Weak<Session>,
        shared: Arc<ServerShared>,
        sub_ring: Ring,
    ) -> Arc<Stream> {
        Arc::new(Stream {
            id,
            fd,
            session,
            shared,
            state: Mutex::new(StreamState {
                status: StreamStatus::Idle,
                parser: RequestParser::new(),
                input: VecDeque::new(),
                in_progress_transaction: false,
                keep_alive: false,
                response_written: false,
                close_posted: false,
            }),
            update: Condvar::new(),
            sub_ring: Mutex::new(sub_ring),
        })
    }

    pub(crate) fn keep_alive_timeout(&self) -> u64 {
        self.shared.keep_alive.timeout_secs
    }

    /// Queue received bytes and wake a blocked body reader.
    pub(crate) fn push_input(&self, slice: RefSlice) {
        let mut state = self.state.lock();
        state.input.push_back(slice);
        drop(state);
        self.update.notify_one();
    }

    /// Push unconsumed bytes back to the front of the queue so the next
    /// read (or the next request) starts cleanly.
    pub(crate) fn unread(&self, slice: RefSlice) {
        if slice.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.input.push_front(slice);
    }

    /// Drive the parser over queued input. Returns a materialised
    /// transaction once a request head is final. While a transaction is
    /// in progress the queued bytes belong to its body reader and are
    /// left alone.
    pub(crate) fn process_input(
        self: &Arc<Self>,
    ) -> Result<Option<Transaction>, ParseError> {
        let mut state = self.state.lock();
        if state.in_progress_transaction {
            return Ok(None);
        }
        loop {
            let Some(mut slice) = state.input.pop_front() else {
                return Ok(None);
            };
            let feed = state.parser.feed(&slice)?;
            if feed.consumed < slice.len() {
                slice.advance(feed.consumed);
                state.input.push_front(slice);
            }
            if feed.complete {
                let request = state.parser.take_request();
                let keep_alive = self.shared.keep_alive.enabled && request.wants_keep_alive();
                state.in_progress_transaction = true;
                state.keep_alive = keep_alive;
                if state.status == StreamStatus::Idle {
                    state.status = StreamStatus::Open;
                }
                drop(state);
                trace!(stream = self.id, method = %request.method, path = %request.path, "request parsed");
                return Ok(Some(Transaction::new(self.clone(), request, keep_alive)));
            }
        }
    }

    /// Pop the next queued input slice, blocking until data arrives or
    /// the peer half closes. Ensures the session keeps a read armed
    /// while the caller waits. Returns `None` on EOF.
    pub(crate) fn read_buffer(&self) -> Option<RefSlice> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(slice) = state.input.pop_front() {
                    return Some(slice);
                }
                if matches!(
                    state.status,
                    StreamStatus::HalfClosedRemote | StreamStatus::Closed
                ) {
                    return None;
                }
            }

            // Arm a read without holding the stream lock (lock order is
            // session before stream).
            let Some(session) = self.session.upgrade() else {
                return None;
            };
            if session.set_read_buffer().is_err() {
                return None;
            }

            let mut state = self.state.lock();
            if let Some(slice) = state.input.pop_front() {
                return Some(slice);
            }
            if matches!(
                state.status,
                StreamStatus::HalfClosedRemote | StreamStatus::Closed
            ) {
                return None;
            }
            self.update.wait(&mut state);
        }
    }

    /// Serialise and send a response head. Panics if a head was already
    /// written on this exchange: two status lines on one wire is a
    /// handler bug.
    pub(crate) fn write_response(
        &self,
        response: &Response,
        version: Version,
    ) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock();
            assert!(
                !state.response_written,
                "response head already written on stream {}",
                self.id
            );
            state.response_written = true;
        }
        let mut wire = BytesMut::with_capacity(256);
        response.serialize_into(version, &mut wire);
        self.write_slice(&wire)
    }

    /// Send one buffer on the sub-ring, consuming exactly one
    /// completion per submission. Short writes resubmit the remainder.
    pub(crate) fn write_slice(&self, bytes: &[u8]) -> Result<(), ServerError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut ring = self.sub_ring.lock();
        let mut offset = 0;
        while offset < bytes.len() {
            let remaining = &bytes[offset..];
            ring.send(self.fd, remaining.as_ptr(), remaining.len() as u32, 0)
                .map_err(ServerError::Ring)?;
            ring.submit().map_err(ServerError::Ring)?;
            let cqe = ring.wait_cqe().map_err(ServerError::Ring)?;
            match cqe.as_send() {
                SendResult::Bytes(n) => offset += n,
                SendResult::Again => continue,
                other => {
                    debug!(stream = self.id, result = ?other, "send failed");
                    return Err(ServerError::StreamClosed);
                }
            }
        }
        Ok(())
    }

    /// Publish anything still staged on the sub-ring. Writes are
    /// synchronous, so this is only needed after an error path bailed
    /// between stage and submit.
    pub(crate) fn flush(&self) -> Result<(), ServerError> {
        self.sub_ring.lock().submit().map_err(ServerError::Ring)?;
        Ok(())
    }

    pub(crate) fn has_transaction(&self) -> bool {
        self.state.lock().in_progress_transaction
    }

    /// The current exchange can no longer hand the connection over
    /// cleanly; close instead of re-arming when it ends.
    pub(crate) fn disable_keep_alive(&self) {
        self.state.lock().keep_alive = false;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().status == StreamStatus::Closed
    }

    /// Peer sent EOF. With no transaction running the stream closes;
    /// otherwise the handler may still write its response.
    pub(crate) fn remote_closed(self: &Arc<Self>) {
        let close_now = {
            let mut state = self.state.lock();
            if state.in_progress_transaction {
                state.status = StreamStatus::HalfClosedRemote;
                false
            } else {
                true
            }
        };
        self.update.notify_all();
        if close_now {
            self.close();
        }
    }

    /// Begin closing if idle. Called by `Session::check_closing`; a
    /// stream with a live transaction defers to `mark_response_end`.
    pub(crate) fn begin_close(self: &Arc<Self>) {
        let defer = {
            let mut state = self.state.lock();
            if state.status == StreamStatus::Closed {
                return;
            }
            if state.in_progress_transaction {
                state.status = StreamStatus::HalfClosedLocal;
                true
            } else {
                false
            }
        };
        if !defer {
            self.close();
        }
    }

    /// Close the stream and post a `CloseStream` event so the
    /// dispatcher detaches it from the session.
    pub(crate) fn close(self: &Arc<Self>) {
        let post = {
            let mut state = self.state.lock();
            let was_closed = state.status == StreamStatus::Closed;
            state.status = StreamStatus::Closed;
            let post = !state.close_posted && !was_closed;
            state.close_posted = post || state.close_posted;
            post
        };
        self.update.notify_all();
        if !post {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let event = Box::new(ServerEvent::CloseStream {
            session,
            stream: self.clone(),
        });
        let user_data = event.into_user_data();
        if let Err(e) = self
            .shared
            .submit_with_retry(|| self.shared.submitter.nop(user_data))
        {
            debug!(stream = self.id, error = %e, "close event post failed");
            // Reclaim the leaked tag; the dispatcher will never see it.
            drop(unsafe { ServerEvent::from_user_data(user_data) });
        }
    }

    /// Called when a transaction is destroyed: either re-arm for the
    /// next request (keep-alive) or begin closing. Pipelined requests
    /// already sitting in the input queue are parsed and dispatched
    /// here.
    pub(crate) fn mark_response_end(self: &Arc<Self>) {
        let (keep_alive, closing) = {
            let mut state = self.state.lock();
            state.in_progress_transaction = false;
            state.response_written = false;
            let closing = matches!(
                state.status,
                StreamStatus::HalfClosedLocal
                    | StreamStatus::HalfClosedRemote
                    | StreamStatus::Closed
            );
            if !closing {
                state.status = StreamStatus::Idle;
            }
            (state.keep_alive, closing)
        };

        if closing || !keep_alive {
            self.close();
            return;
        }

        // A pipelined request may already be complete in the queue.
        match self.process_input() {
            Ok(Some(transaction)) => {
                crate::dispatch::dispatch_transaction(&self.shared, transaction);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                debug!(stream = self.id, error = %e, "pipelined parse failed");
                let _ = self.write_slice(protocol_http::BAD_REQUEST);
                if let Some(session) = self.session.upgrade() {
                    session.close();
                }
                self.close();
                return;
            }
        }

        if let Some(session) = self.session.upgrade() {
            if let Err(e) = session.set_read_buffer() {
                debug!(stream = self.id, error = %e, "re-arm after response failed");
                self.close();
            }
        }
    }
}

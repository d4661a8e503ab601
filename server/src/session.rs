//! Transport-level connection state.
//!
//! A session owns the socket descriptor, the single in-flight read
//! operation, the pool of read buffers and the list of logical streams.
//! Lock order is always session before stream, never the reverse.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use io_ring::{BufferPool, RefBuffer, RefSlice, DEFAULT_BUFFER_SIZE};
use parklot::Mutex;
use tracing::debug;

use crate::error::ServerError;
use crate::event::ServerEvent;
use crate::shared::ServerShared;
use crate::stream::Stream;

/// What kind of socket the session sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Tcp,
    Unix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionStatus {
    Open,
    Closing,
    Closed,
}

struct ActiveRead {
    buffer: Arc<RefBuffer>,
    user_data: u64,
}

struct SessionState {
    status: SessionStatus,
    active_read: Option<ActiveRead>,
    pool: BufferPool,
    streams: Vec<Arc<Stream>>,
    /// Odd ids are reserved for server-initiated streams on future
    /// multiplexed transports; HTTP/1 only ever uses id 1.
    next_stream_id: u32,
}

pub(crate) struct Session {
    pub(crate) fd: RawFd,
    #[allow(dead_code)]
    pub(crate) transport: Transport,
    shared: Arc<ServerShared>,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(fd: RawFd, transport: Transport, shared: Arc<ServerShared>) -> Arc<Session> {
        Arc::new(Session {
            fd,
            transport,
            shared,
            state: Mutex::new(SessionState {
                status: SessionStatus::Open,
                active_read: None,
                pool: BufferPool::new(),
                streams: Vec::with_capacity(1),
                next_stream_id: 1,
            }),
        })
    }

    /// Create the session's stream. HTTP/1 carries exactly one stream
    /// per session; a second open is a protocol bug.
    pub(crate) fn open_stream(
        self: &Arc<Self>,
        main_ring: &io_ring::Ring,
    ) -> Result<Arc<Stream>, ServerError> {
        let mut state = self.state.lock();
        assert!(
            state.streams.is_empty(),
            "HTTP/1 session already has a stream"
        );
        let id = state.next_stream_id;
        state.next_stream_id += 2;
        let sub_ring = main_ring.child(self.shared.sub_ring_entries)?;
        let stream = Stream::new(id, self.fd, Arc::downgrade(self), self.shared.clone(), sub_ring);
        state.streams.push(stream.clone());
        Ok(stream)
    }

    pub(crate) fn current_stream(&self) -> Option<Arc<Stream>> {
        self.state.lock().streams.first().cloned()
    }

    /// Arm a read: claim a pool buffer, tag a `ReadBuffer` event and
    /// post a recv. Idempotent while a read is already in flight.
    pub(crate) fn set_read_buffer(self: &Arc<Self>) -> Result<(), ServerError> {
        let (buffer, user_data) = {
            let mut state = self.state.lock();
            if state.active_read.is_some() || state.status != SessionStatus::Open {
                return Ok(());
            }
            let buffer = state.pool.acquire(DEFAULT_BUFFER_SIZE);
            let event = Box::new(ServerEvent::ReadBuffer {
                session: self.clone(),
            });
            let user_data = event.into_user_data();
            state.active_read = Some(ActiveRead {
                buffer: buffer.clone(),
                user_data,
            });
            (buffer, user_data)
        };

        let fd = self.fd;
        let len = buffer.capacity() as u32;
        let ptr = buffer.as_mut_ptr();
        let result = self
            .shared
            .submit_with_retry(|| self.shared.submitter.recv(fd, ptr, len, user_data));
        if let Err(e) = &result {
            debug!(fd, error = %e, "failed to arm read");
            let mut state = self.state.lock();
            if let Some(active) = state.active_read.take() {
                // Reclaim the event we leaked and the buffer claim.
                drop(unsafe { ServerEvent::from_user_data(active.user_data) });
                active.buffer.release();
            }
        }
        result
    }

    /// Consume the in-flight read on a successful completion, producing
    /// a slice over the received bytes.
    pub(crate) fn take_read_slice(&self, len: usize) -> Option<RefSlice> {
        let mut state = self.state.lock();
        let active = state.active_read.take()?;
        let slice = active.buffer.ref_slice(0, len);
        active.buffer.release();
        Some(slice)
    }

    /// Drop the in-flight read without producing data (EOF, error or
    /// cancellation).
    pub(crate) fn discard_read(&self) {
        let mut state = self.state.lock();
        if let Some(active) = state.active_read.take() {
            active.buffer.release();
        }
    }

    /// Post a cancel for the in-flight read, if any.
    pub(crate) fn cancel_read_buffer(self: &Arc<Self>) -> Result<(), ServerError> {
        let target = match &self.state.lock().active_read {
            Some(active) => active.user_data,
            None => return Ok(()),
        };
        let event = Box::new(ServerEvent::CancelReadBuffer {
            session: self.clone(),
        });
        let user_data = event.into_user_data();
        self.shared
            .submit_with_retry(|| self.shared.submitter.cancel(target, user_data))
    }

    /// Begin shutdown: no new reads are armed and the in-flight one is
    /// cancelled.
    pub(crate) fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status != SessionStatus::Open {
                return;
            }
            state.status = SessionStatus::Closing;
        }
        if let Err(e) = self.cancel_read_buffer() {
            debug!(fd = self.fd, error = %e, "cancel on close failed");
        }
    }

    /// True when the session can be destroyed: not open, no in-flight
    /// operation and every stream closed. Idle streams are asked to
    /// begin their close as a side effect.
    pub(crate) fn check_closing(&self) -> bool {
        let state = self.state.lock();
        if state.status == SessionStatus::Open {
            return false;
        }
        if state.active_read.is_some() {
            return false;
        }
        let mut all_closed = true;
        for stream in &state.streams {
            stream.begin_close();
            if !stream.is_closed() {
                all_closed = false;
            }
        }
        all_closed
    }

    /// Detach a finished stream. Returns the number of streams left.
    pub(crate) fn remove_stream(&self, stream: &Arc<Stream>) -> usize {
        let mut state = self.state.lock();
        state.streams.retain(|s| !Arc::ptr_eq(s, stream));
        state.streams.len()
    }

    /// Mark fully closed; the dispatcher closes the descriptor.
    pub(crate) fn mark_closed(&self) {
        self.state.lock().status = SessionStatus::Closed;
    }
}

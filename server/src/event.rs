//! Completion tags.
//!
//! Every SQE the server submits carries either zero (the completion is
//! ignored) or a pointer to a boxed [`ServerEvent`]. The box is leaked
//! into the user-data at submit time and reclaimed by the dispatcher
//! when the completion is processed, so the tag outlives the operation
//! by construction. Accept operations are the exception: they are
//! tagged with a pointer into the listener array and recognised by
//! pointer range before any box is reconstructed.

use std::sync::Arc;

use crate::session::Session;
use crate::stream::Stream;

pub(crate) enum ServerEvent {
    /// A recv with a pool buffer is in flight for this session.
    ReadBuffer { session: Arc<Session> },
    /// A stream finished and wants to be detached from its session.
    CloseStream {
        session: Arc<Session>,
        stream: Arc<Stream>,
    },
    /// A cancel was posted for the session's in-flight read.
    CancelReadBuffer { session: Arc<Session> },
    /// Wake the dispatch loop to re-check the server status.
    CheckServerStatus,
}

impl ServerEvent {
    /// Leak the event into a user-data tag.
    pub(crate) fn into_user_data(self: Box<Self>) -> u64 {
        Box::into_raw(self) as u64
    }

    /// Reclaim an event from a completion's user-data.
    ///
    /// # Safety
    /// `user_data` must be a tag produced by `into_user_data` that has
    /// not been reclaimed yet.
    pub(crate) unsafe fn from_user_data(user_data: u64) -> Box<ServerEvent> {
        unsafe { Box::from_raw(user_data as *mut ServerEvent) }
    }
}

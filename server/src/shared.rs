//! State shared between the dispatcher, sessions, streams and workers.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use io_ring::Submitter;
use parklot::{Condvar, Mutex};

use crate::config::KeepAliveConfig;
use crate::error::ServerError;
use crate::event::ServerEvent;
use crate::router::Router;
use crate::worker::WorkQueue;

const STATUS_RUNNING: u8 = 0;
const STATUS_STOPPING: u8 = 1;

pub(crate) struct ServerShared {
    /// Thread-safe submission handle onto the main ring.
    pub(crate) submitter: Submitter,
    /// Signaled by the dispatcher after every processed completion;
    /// submitters blocked on a full SQ wait here.
    sq_mutex: Mutex<()>,
    sq_available: Condvar,
    status: AtomicU8,
    pub(crate) keep_alive: KeepAliveConfig,
    pub(crate) work: Arc<WorkQueue>,
    pub(crate) router: Arc<Router>,
    pub(crate) sub_ring_entries: u32,
}

impl ServerShared {
    pub(crate) fn new(
        submitter: Submitter,
        keep_alive: KeepAliveConfig,
        work: Arc<WorkQueue>,
        router: Arc<Router>,
        sub_ring_entries: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            submitter,
            sq_mutex: Mutex::new(()),
            sq_available: Condvar::new(),
            status: AtomicU8::new(STATUS_RUNNING),
            keep_alive,
            work,
            router,
            sub_ring_entries,
        })
    }

    pub(crate) fn stopping(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_STOPPING
    }

    /// Request shutdown and wake the dispatch loop.
    pub(crate) fn stop(&self) {
        self.status.store(STATUS_STOPPING, Ordering::Release);
        let event = Box::new(ServerEvent::CheckServerStatus);
        // Losing this nop to a full queue is fine: any completion wakes
        // the loop, which re-checks the status.
        let _ = self.submitter.nop(event.into_user_data());
    }

    /// Wake submitters that ran into a full submission queue.
    pub(crate) fn signal_sq_available(&self) {
        let _guard = self.sq_mutex.lock();
        self.sq_available.notify_all();
    }

    /// Run a submission, waiting out a full SQ. The closure is retried
    /// after each `sq_available` signal.
    pub(crate) fn submit_with_retry(
        &self,
        mut submit: impl FnMut() -> Result<(), io_ring::Error>,
    ) -> Result<(), ServerError> {
        loop {
            match submit() {
                Ok(()) => return Ok(()),
                Err(io_ring::Error::SubmissionQueueFull) => {
                    let mut guard = self.sq_mutex.lock();
                    // Bounded wait: the signal can race the enqueue.
                    self.sq_available
                        .wait_timeout(&mut guard, Duration::from_millis(10));
                }
                Err(e) => return Err(ServerError::Ring(e)),
            }
        }
    }
}

//! Handler thread pool.
//!
//! Transactions are pushed onto a bounded queue and executed by named
//! worker threads. A full queue is reported back to the dispatcher,
//! which answers 429 itself rather than blocking the event loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parklot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::router::Router;
use crate::transaction::Transaction;

/// A unit of handler work: the transaction plus the routing table that
/// will serve it.
pub(crate) struct TransactionContext {
    pub(crate) transaction: Transaction,
    pub(crate) router: Arc<Router>,
}

struct QueueState {
    tasks: VecDeque<TransactionContext>,
    shutdown: bool,
}

pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl WorkQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::with_capacity(capacity.min(1024)),
                shutdown: false,
            }),
            available: Condvar::new(),
            capacity,
        })
    }

    /// Push one context; hands it back if the queue is full or closed.
    pub(crate) fn try_push(&self, ctx: TransactionContext) -> Result<(), TransactionContext> {
        let mut state = self.state.lock();
        if state.shutdown || state.tasks.len() >= self.capacity {
            return Err(ctx);
        }
        state.tasks.push_back(ctx);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<TransactionContext> {
        let mut state = self.state.lock();
        loop {
            if let Some(ctx) = state.tasks.pop_front() {
                return Some(ctx);
            }
            if state.shutdown {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    pub(crate) fn shutdown(&self) {
        let drained: Vec<TransactionContext> = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.tasks.drain(..).collect()
        };
        self.available.notify_all();
        // Dropping a queued transaction finishes its exchange; do that
        // outside the queue lock since it writes to the socket.
        drop(drained);
    }
}

pub(crate) struct WorkerPool {
    queue: Arc<WorkQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` named workers draining the queue.
    pub(crate) fn spawn(queue: Arc<WorkQueue>, threads: usize) -> WorkerPool {
        let mut handles = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let queue = queue.clone();
            let handle = std::thread::Builder::new()
                .name(format!("http-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, queue))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        WorkerPool { queue, handles }
    }

    /// Stop accepting work, drop queued transactions and join the
    /// threads. Queued transactions still run their drop path, so their
    /// streams are released cleanly.
    pub(crate) fn shutdown(self) {
        self.queue.shutdown();
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
    }
}

fn worker_loop(worker_id: usize, queue: Arc<WorkQueue>) {
    while let Some(ctx) = queue.pop() {
        let TransactionContext {
            mut transaction,
            router,
        } = ctx;
        // Handler errors are logged, never propagated: the transaction's
        // drop still flushes and finishes the exchange.
        if let Err(e) = router.dispatch(&mut transaction) {
            debug!(worker = worker_id, error = %e, "handler returned error");
        }
        drop(transaction);
    }
}

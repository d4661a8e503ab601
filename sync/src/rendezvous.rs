//! One-to-one thread hand-off.
//!
//! Each participating thread owns a [`Rendezvous`]; `wait_timeout`
//! suspends the owner and `resume` releases it from another thread. A
//! resume that arrives before the matching wait is remembered, so the
//! pair can be used for strict turn-taking without a lost-wake window.
//! `switch_to` combines the two to hand control over, which is how a
//! dispatcher yields to an owner thread and back.

use std::time::{Duration, Instant};

use crate::{Condvar, Mutex};

pub struct Rendezvous {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Rendezvous {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Suspend the owning thread until [`resume`](Self::resume) or the
    /// timeout. Consumes one pending resume. Returns true when resumed.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending = self.pending.lock();
        while !*pending {
            match deadline {
                None => self.cond.wait(&mut pending),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.cond.wait_timeout(&mut pending, deadline - now);
                }
            }
        }
        *pending = false;
        true
    }

    /// Release the owning thread of `self`, or arm the next wait.
    pub fn resume(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Hand control to `target`'s owner and suspend until resumed.
    pub fn switch_to(&self, target: &Rendezvous) -> bool {
        target.resume();
        self.wait_timeout(None)
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

//! parklot - compact userspace synchronization primitives.
//!
//! A process-wide "parking lot" maps arbitrary addresses to wait queues,
//! so a lock or condition variable needs only one or two bits of inline
//! state. On top of it sit a barging [`Mutex`], a [`Condvar`] and a
//! one-to-one [`Rendezvous`] hand-off.
//!
//! Blocking bottoms out in a per-thread futex word on Linux and a
//! mutex/condvar pair elsewhere.

mod condvar;
mod mutex;
mod parker;
mod parking_lot;
mod rendezvous;
mod word_lock;

pub use condvar::{Condvar, WaitTimeoutResult};
pub use mutex::{Mutex, MutexGuard};
pub use parking_lot::{deinit, init, park, unpark_all, unpark_one, ParkResult, UnparkResult};
pub use rendezvous::Rendezvous;

pub(crate) use parker::ThreadParker;
pub(crate) use word_lock::WordLock;

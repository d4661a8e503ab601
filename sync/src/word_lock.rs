//! One-word lock used for parking-lot buckets.
//!
//! Bit layout of the state word: bit 0 = locked, bit 1 = queue locked,
//! remaining bits = head pointer of the waiter queue. Waiter nodes live
//! on the stack of the blocked thread; they are linked forward through
//! `next` and the head node caches the queue tail once it has been
//! discovered by an unlocker.

use std::cell::Cell;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::ThreadParker;

const LOCKED_BIT: usize = 1;
const QUEUE_LOCKED_BIT: usize = 2;
const QUEUE_MASK: usize = !3;

/// Spin budget before a thread gives up and parks.
const SPIN_LIMIT: u32 = 40;

struct Waiter {
    parker: ThreadParker,
    // All three fields are only touched while holding the queue lock,
    // except `next` which the enqueuing thread writes before the CAS
    // that publishes the node.
    queue_tail: Cell<*const Waiter>,
    prev: Cell<*const Waiter>,
    next: Cell<*const Waiter>,
}

pub(crate) struct WordLock {
    state: AtomicUsize,
}

impl WordLock {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) {
        if self
            .state
            .compare_exchange_weak(0, LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    /// # Safety
    /// The lock must be held by the current thread.
    #[inline]
    pub(crate) unsafe fn unlock(&self) {
        let state = self.state.fetch_sub(LOCKED_BIT, Ordering::Release);
        if state & QUEUE_LOCKED_BIT != 0 || state & QUEUE_MASK == 0 {
            return;
        }
        self.unlock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        let mut spin = 0u32;
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            // Grab the lock whenever it looks free, even if others queued
            // first. Barging is deliberate here.
            if state & LOCKED_BIT == 0 {
                match self.state.compare_exchange_weak(
                    state,
                    state | LOCKED_BIT,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(s) => state = s,
                }
                continue;
            }

            if state & QUEUE_MASK == 0 && spin < SPIN_LIMIT {
                spin += 1;
                if spin < 10 {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
                state = self.state.load(Ordering::Relaxed);
                continue;
            }

            // Enqueue ourselves at the head of the waiter list.
            let waiter = Waiter {
                parker: ThreadParker::new(),
                queue_tail: Cell::new(std::ptr::null()),
                prev: Cell::new(std::ptr::null()),
                next: Cell::new(std::ptr::null()),
            };
            waiter.parker.prepare_park();

            let queue_head = (state & QUEUE_MASK) as *const Waiter;
            if queue_head.is_null() {
                // First waiter: we are head and tail.
                waiter.queue_tail.set(&waiter);
            } else {
                waiter.queue_tail.set(std::ptr::null());
                waiter.next.set(queue_head);
            }

            if let Err(s) = self.state.compare_exchange_weak(
                state,
                (state & !QUEUE_MASK) | (&waiter as *const Waiter as usize),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                state = s;
                continue;
            }

            waiter.parker.park();

            // Woken: start over with a fresh spin budget.
            spin = 0;
            state = self.state.load(Ordering::Relaxed);
        }
    }

    #[cold]
    fn unlock_slow(&self) {
        // Take the queue lock so exactly one thread walks the list.
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & QUEUE_LOCKED_BIT != 0 || state & QUEUE_MASK == 0 {
                return;
            }
            match self.state.compare_exchange_weak(
                state,
                state | QUEUE_LOCKED_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(s) => state = s,
            }
        }

        'outer: loop {
            debug_assert!(state & QUEUE_LOCKED_BIT != 0);
            debug_assert!(state & QUEUE_MASK != 0);

            // Walk from the head until a cached tail pointer is found,
            // filling in `prev` links along the way. The queue is only
            // ever mutated under the queue lock, so this walk is safe.
            let queue_head = (state & QUEUE_MASK) as *const Waiter;
            let queue_tail;
            let mut current = queue_head;
            loop {
                let tail = unsafe { (*current).queue_tail.get() };
                if !tail.is_null() {
                    queue_tail = tail;
                    break;
                }
                unsafe {
                    let next = (*current).next.get();
                    debug_assert!(!next.is_null());
                    (*next).prev.set(current);
                    current = next;
                }
            }
            unsafe {
                (*queue_head).queue_tail.set(queue_tail);
            }

            // If the lock has been re-acquired in the meantime, leave the
            // wake to the new owner's unlock. Just drop the queue lock.
            if state & LOCKED_BIT != 0 {
                match self.state.compare_exchange_weak(
                    state,
                    state & !QUEUE_LOCKED_BIT,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(s) => {
                        state = s;
                        // The walked prefix stays valid; retry the checks.
                        fence(Ordering::Acquire);
                        continue 'outer;
                    }
                }
            }

            let new_tail = unsafe { (*queue_tail).prev.get() };
            if new_tail.is_null() {
                // Dequeueing the last waiter empties the queue. A failed
                // CAS means a new waiter appeared; keep the queue lock and
                // start over so it is not lost.
                loop {
                    match self.state.compare_exchange_weak(
                        state,
                        state & LOCKED_BIT,
                        Ordering::Release,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(s) => {
                            state = s;
                            if state & QUEUE_MASK == 0 {
                                continue;
                            } else {
                                fence(Ordering::Acquire);
                                continue 'outer;
                            }
                        }
                    }
                }
            } else {
                unsafe {
                    (*queue_head).queue_tail.set(new_tail);
                }
                self.state.fetch_and(!QUEUE_LOCKED_BIT, Ordering::Release);
            }

            // The dequeued waiter's node is about to disappear from its
            // stack once unparked; do not touch it afterwards.
            unsafe {
                (*queue_tail).parker.unpark();
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Shared {
        lock: WordLock,
        counter: std::cell::UnsafeCell<u64>,
    }
    unsafe impl Sync for Shared {}
    unsafe impl Send for Shared {}

    #[test]
    fn uncontended() {
        let lock = WordLock::new();
        lock.lock();
        unsafe { lock.unlock() };
        lock.lock();
        unsafe { lock.unlock() };
    }

    #[test]
    fn contended_counter() {
        const THREADS: usize = 8;
        const ITERS: u64 = 10_000;

        let shared = Arc::new(Shared {
            lock: WordLock::new(),
            counter: std::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..ITERS {
                        shared.lock.lock();
                        unsafe {
                            *shared.counter.get() += 1;
                            shared.lock.unlock();
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(unsafe { *shared.counter.get() }, THREADS as u64 * ITERS);
    }
}

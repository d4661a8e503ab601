//! Condition variable on the parking lot.

use std::time::Duration;

use crate::mutex::MutexGuard;
use crate::parking_lot::{self, ParkResult};

/// Result of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

/// Condition variable; waiters park on the condvar's own address so the
/// type itself carries no queue storage.
pub struct Condvar {
    _private: (),
}

impl Condvar {
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Block until notified, releasing the guard's mutex while asleep and
    /// reacquiring it before returning.
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        self.wait_internal(guard, None);
    }

    /// Like [`wait`](Self::wait) with an upper bound on the sleep.
    pub fn wait_timeout<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> WaitTimeoutResult {
        self.wait_internal(guard, Some(timeout))
    }

    fn wait_internal<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> WaitTimeoutResult {
        let addr = self as *const _ as usize;
        let mutex = guard.mutex();
        let result = parking_lot::park(
            addr,
            || true,
            // Release the mutex only after we are queued, so a notify
            // between unlock and sleep cannot be missed.
            || unsafe { mutex.raw().unlock() },
            timeout,
        );
        mutex.raw().lock();
        WaitTimeoutResult(result == ParkResult::TimedOut)
    }

    /// Wake one waiter. Returns true if a thread was woken.
    pub fn notify_one(&self) -> bool {
        let addr = self as *const _ as usize;
        parking_lot::unpark_one(addr, |_| {}).unparked
    }

    /// Wake all waiters; returns how many were woken.
    pub fn notify_all(&self) -> usize {
        let addr = self as *const _ as usize;
        parking_lot::unpark_all(addr)
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn notify_one_wakes_waiter() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let pair2 = pair.clone();

        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*pair2;
            let mut ready = lock.lock();
            while !*ready {
                cvar.wait(&mut ready);
            }
        });

        std::thread::sleep(Duration::from_millis(20));
        {
            let (lock, cvar) = &*pair;
            *lock.lock() = true;
            cvar.notify_one();
        }
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let lock = Mutex::new(());
        let cvar = Condvar::new();
        let mut guard = lock.lock();
        let start = Instant::now();
        let result = cvar.wait_timeout(&mut guard, Duration::from_millis(50));
        assert!(result.timed_out());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn notify_all_releases_everyone() {
        const THREADS: usize = 4;
        let pair = Arc::new((Mutex::new(0usize), Condvar::new()));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pair = pair.clone();
                std::thread::spawn(move || {
                    let (lock, cvar) = &*pair;
                    let mut stage = lock.lock();
                    *stage += 1;
                    while *stage != usize::MAX {
                        cvar.wait(&mut stage);
                    }
                })
            })
            .collect();

        let (lock, cvar) = &*pair;
        loop {
            let mut stage = lock.lock();
            if *stage == THREADS {
                *stage = usize::MAX;
                cvar.notify_all();
                break;
            }
            drop(stage);
            std::thread::yield_now();
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}

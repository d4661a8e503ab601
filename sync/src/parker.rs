//! Per-thread blocking primitive.
//!
//! Every thread owns one parker word. `prepare_park` arms it, `park`
//! sleeps until another thread calls `unpark`, and `park_until` adds a
//! deadline. Spurious wakeups are absorbed internally; a return from
//! `park` means a matching `unpark` happened.

use std::time::Instant;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub(crate) use futex::ThreadParker;
    } else {
        pub(crate) use generic::ThreadParker;
    }
}

#[cfg(target_os = "linux")]
mod futex {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    /// Parker word values.
    const EMPTY: u32 = 0;
    const PARKED: u32 = 1;

    /// Futex-backed parker (one 32-bit word per thread).
    pub(crate) struct ThreadParker {
        futex: AtomicU32,
    }

    impl ThreadParker {
        pub(crate) const fn new() -> Self {
            Self {
                futex: AtomicU32::new(EMPTY),
            }
        }

        /// Arm the parker. Must be called before publishing this thread
        /// on a wait queue, so an early `unpark` is not lost.
        pub(crate) fn prepare_park(&self) {
            self.futex.store(PARKED, Ordering::Relaxed);
        }

        /// Sleep until `unpark` clears the word.
        pub(crate) fn park(&self) {
            while self.futex.load(Ordering::Acquire) == PARKED {
                self.futex_wait(None);
            }
        }

        /// Sleep until `unpark` or the deadline. Returns true if unparked.
        pub(crate) fn park_until(&self, deadline: Instant) -> bool {
            while self.futex.load(Ordering::Acquire) == PARKED {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let diff = deadline - now;
                let ts = libc::timespec {
                    tv_sec: diff.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                    tv_nsec: diff.subsec_nanos() as _,
                };
                self.futex_wait(Some(ts));
            }
            true
        }

        /// Release a parked (or about-to-park) thread.
        pub(crate) fn unpark(&self) {
            self.futex.store(EMPTY, Ordering::Release);
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.futex.as_ptr(),
                    libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                    1i32,
                );
            }
        }

        fn futex_wait(&self, timeout: Option<libc::timespec>) {
            let ts_ptr = timeout
                .as_ref()
                .map(|ts| ts as *const libc::timespec)
                .unwrap_or(std::ptr::null());
            let r = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.futex.as_ptr(),
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    PARKED,
                    ts_ptr,
                )
            };
            if r < 0 {
                let errno = unsafe { *libc::__errno_location() };
                // EAGAIN: word already cleared. EINTR/ETIMEDOUT: loop re-checks.
                debug_assert!(
                    errno == libc::EAGAIN || errno == libc::EINTR || errno == libc::ETIMEDOUT,
                    "unexpected futex errno {errno}"
                );
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod generic {
    use std::sync::{Condvar, Mutex};
    use std::time::Instant;

    /// Portable parker for platforms without a usable futex.
    pub(crate) struct ThreadParker {
        parked: Mutex<bool>,
        condvar: Condvar,
    }

    impl ThreadParker {
        pub(crate) const fn new() -> Self {
            Self {
                parked: Mutex::new(false),
                condvar: Condvar::new(),
            }
        }

        pub(crate) fn prepare_park(&self) {
            *self.parked.lock().unwrap() = true;
        }

        pub(crate) fn park(&self) {
            let mut parked = self.parked.lock().unwrap();
            while *parked {
                parked = self.condvar.wait(parked).unwrap();
            }
        }

        pub(crate) fn park_until(&self, deadline: Instant) -> bool {
            let mut parked = self.parked.lock().unwrap();
            while *parked {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (guard, _) = self
                    .condvar
                    .wait_timeout(parked, deadline - now)
                    .unwrap();
                parked = guard;
            }
            true
        }

        pub(crate) fn unpark(&self) {
            *self.parked.lock().unwrap() = false;
            self.condvar.notify_one();
        }
    }
}

/// Deadline helper shared by timed waits: `None` means wait forever.
pub(crate) fn deadline_from(timeout: Option<std::time::Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    struct SyncParker(ThreadParker);
    // Test-only: the parker word is safe to poke from two threads.
    unsafe impl Sync for SyncParker {}
    unsafe impl Send for SyncParker {}

    #[test]
    fn park_unpark() {
        let parker = Arc::new(SyncParker(ThreadParker::new()));
        parker.0.prepare_park();

        let p = parker.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            p.0.unpark();
        });

        parker.0.park();
        waker.join().unwrap();
    }

    #[test]
    fn park_until_times_out() {
        let parker = ThreadParker::new();
        parker.prepare_park();
        let start = Instant::now();
        let unparked = parker.park_until(Instant::now() + Duration::from_millis(40));
        assert!(!unparked);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn unpark_before_park_is_not_lost() {
        let parker = ThreadParker::new();
        parker.prepare_park();
        parker.unpark();
        // Must return immediately.
        parker.park();
    }
}

//! Reference-counted read buffers.
//!
//! A [`RefBuffer`] is a byte vector with an atomic use count that gates
//! *reuse*, not deallocation: when the count returns to zero the buffer
//! may be handed out again by its pool, and the memory itself lives
//! until the pool is dropped. [`RefSlice`] is a `[start, end)` view that
//! shares the count.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Default capacity for pool-allocated read buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

pub struct RefBuffer {
    refs: AtomicU32,
    data: UnsafeCell<Box<[u8]>>,
}

// The contents are only written through `as_mut_ptr` by the single
// holder of a freshly acquired buffer (refs == 1, no slices yet); every
// access through a RefSlice is a read. See `try_acquire`.
unsafe impl Send for RefBuffer {}
unsafe impl Sync for RefBuffer {}

impl RefBuffer {
    /// Allocate a buffer with its count already at one: the creator owns
    /// the initial reference.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicU32::new(1),
            data: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
        })
    }

    pub fn capacity(&self) -> usize {
        unsafe { (&*self.data.get()).len() }
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Claim an idle buffer: transitions the count 0 -> 1. Fails if the
    /// buffer is still referenced somewhere.
    pub fn try_acquire(&self) -> bool {
        self.refs
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Drop one reference. At zero the buffer becomes reusable.
    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "refcount underflow");
    }

    /// Raw pointer for the kernel to write received bytes into.
    ///
    /// Only valid to write through while the caller holds the sole
    /// reference from `try_acquire`/`with_capacity` and no slice exists.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    /// Take an additional reference as a slice view.
    pub fn ref_slice(self: &Arc<Self>, start: usize, end: usize) -> RefSlice {
        assert!(start <= end && end <= self.capacity());
        self.refs.fetch_add(1, Ordering::Relaxed);
        RefSlice {
            buf: self.clone(),
            start,
            end,
        }
    }
}

/// A shared view into a [`RefBuffer`]. Cloning bumps the buffer's count;
/// dropping releases it.
pub struct RefSlice {
    buf: Arc<RefBuffer>,
    start: usize,
    end: usize,
}

impl RefSlice {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// A sub-view relative to this slice, sharing the same count.
    pub fn slice(&self, start: usize, end: usize) -> RefSlice {
        assert!(start <= end && end <= self.len());
        self.buf.ref_slice(self.start + start, self.start + end)
    }

    /// Narrow this slice in place (used to push unparsed bytes back).
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len());
        self.start += n;
    }
}

impl Deref for RefSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { &(&*self.buf.data.get())[self.start..self.end] }
    }
}

impl Clone for RefSlice {
    fn clone(&self) -> Self {
        self.buf.ref_slice(self.start, self.end)
    }
}

impl Drop for RefSlice {
    fn drop(&mut self) {
        self.buf.release();
    }
}

impl std::fmt::Debug for RefSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefSlice")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

/// Pool of read buffers owned by one connection.
///
/// Acquisition is a first-fit scan: the first idle slot large enough is
/// claimed with a 0 -> 1 transition; if none fits, a new buffer is
/// allocated and tracked. All memory is freed together when the pool is
/// dropped.
pub struct BufferPool {
    slots: Vec<Arc<RefBuffer>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn acquire(&mut self, want: usize) -> Arc<RefBuffer> {
        for slot in &self.slots {
            if slot.capacity() >= want && slot.try_acquire() {
                return slot.clone();
            }
        }
        let buf = RefBuffer::with_capacity(want.max(DEFAULT_BUFFER_SIZE));
        self.slots.push(buf.clone());
        buf
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_shares_count() {
        let buf = RefBuffer::with_capacity(64);
        assert_eq!(buf.refs(), 1);

        let slice = buf.ref_slice(0, 16);
        assert_eq!(buf.refs(), 2);

        let sub = slice.slice(4, 8);
        assert_eq!(buf.refs(), 3);
        assert_eq!(sub.len(), 4);

        drop(slice);
        drop(sub);
        assert_eq!(buf.refs(), 1);

        buf.release();
        assert_eq!(buf.refs(), 0);
    }

    #[test]
    fn pool_reuses_idle_slots() {
        let mut pool = BufferPool::new();
        let a = pool.acquire(1024);
        assert_eq!(pool.len(), 1);

        // Still referenced: a second acquire must allocate.
        let b = pool.acquire(1024);
        assert_eq!(pool.len(), 2);

        a.release();
        let c = pool.acquire(1024);
        assert_eq!(pool.len(), 2, "idle slot reused");

        b.release();
        c.release();
    }

    #[test]
    fn pool_respects_capacity_request() {
        let mut pool = BufferPool::new();
        let small = pool.acquire(16);
        small.release();

        let big = pool.acquire(DEFAULT_BUFFER_SIZE * 4);
        assert!(big.capacity() >= DEFAULT_BUFFER_SIZE * 4);
        assert_eq!(pool.len(), 2, "small idle slot did not satisfy big request");
        big.release();
    }

    #[test]
    fn concurrent_slices_quiesce_to_zero() {
        const THREADS: usize = 8;
        const ITERS: usize = 5_000;

        let buf = RefBuffer::with_capacity(256);
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    for i in 0..ITERS {
                        let s = buf.ref_slice(0, (i % 256).min(buf.capacity()));
                        let t = s.clone();
                        drop(s);
                        drop(t);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        buf.release();
        assert_eq!(buf.refs(), 0);
        assert!(buf.try_acquire(), "buffer reusable after quiescence");
    }

    #[test]
    fn slice_contents_visible() {
        let buf = RefBuffer::with_capacity(16);
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), buf.as_mut_ptr(), 5);
        }
        let slice = buf.ref_slice(0, 5);
        assert_eq!(&*slice, b"hello");
        drop(slice);
        buf.release();
    }
}

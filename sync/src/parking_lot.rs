//! Process-wide parking lot.
//!
//! A hash of buckets maps arbitrary addresses to wait queues so that a
//! primitive built on top needs no per-instance queue storage. Each
//! bucket is guarded by a [`WordLock`] and holds an intrusive FIFO of
//! per-thread nodes. The table grows when the number of parked threads
//! exceeds one third of the bucket count; retired tables stay linked
//! behind the new one so a racing reader can still unlock the bucket it
//! hashed into.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::parker::deadline_from;
use crate::{ThreadParker, WordLock};

/// Outcome of a [`park`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkResult {
    /// Another thread called [`unpark_one`] or [`unpark_all`] on the key.
    Unparked,
    /// The validation callback returned false; the thread never slept.
    Invalid,
    /// The timeout elapsed before an unpark arrived.
    TimedOut,
}

/// Outcome handed to the [`unpark_one`] callback while the bucket is
/// still locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnparkResult {
    /// A thread was dequeued and will be woken.
    pub unparked: bool,
    /// More threads remain parked on the same key.
    pub have_more: bool,
}

/// Per-thread queue node. Lives in thread-local storage; it is only
/// reachable from a bucket while its owner is inside [`park`], so the
/// node never outlives its thread.
struct ThreadData {
    parker: ThreadParker,
    key: AtomicUsize,
    next_in_queue: Cell<*const ThreadData>,
}

impl ThreadData {
    const fn new() -> Self {
        Self {
            parker: ThreadParker::new(),
            key: AtomicUsize::new(0),
            next_in_queue: Cell::new(ptr::null()),
        }
    }
}

thread_local! {
    static THREAD_DATA: ThreadData = const { ThreadData::new() };
}

#[repr(align(64))]
struct Bucket {
    lock: WordLock,
    queue_head: Cell<*const ThreadData>,
    queue_tail: Cell<*const ThreadData>,
}

// Queue pointers are only accessed with the bucket lock held.
unsafe impl Sync for Bucket {}
unsafe impl Send for Bucket {}

impl Bucket {
    fn new() -> Self {
        Self {
            lock: WordLock::new(),
            queue_head: Cell::new(ptr::null()),
            queue_tail: Cell::new(ptr::null()),
        }
    }
}

struct HashTable {
    entries: Box<[Bucket]>,
    hash_bits: u32,
    /// Previous (smaller) table, kept alive for readers that hashed into
    /// it while the swap was in progress.
    prev: *mut HashTable,
}

impl HashTable {
    fn new(num_threads: usize, prev: *mut HashTable) -> Box<Self> {
        // Three buckets per thread keeps queues short.
        let new_size = (num_threads * 3).next_power_of_two().max(4);
        let hash_bits = new_size.trailing_zeros();
        let entries = (0..new_size).map(|_| Bucket::new()).collect();
        Box::new(Self {
            entries,
            hash_bits,
            prev,
        })
    }
}

static HASHTABLE: AtomicPtr<HashTable> = AtomicPtr::new(ptr::null_mut());
static NUM_PARKED: AtomicUsize = AtomicUsize::new(0);

/// Initialise the process-wide table. Idempotent; called implicitly by
/// the first park if skipped.
pub fn init() {
    get_hashtable();
}

/// Tear the table down. Only sound once no thread can park again; meant
/// for process exit and tests.
///
/// # Safety
/// Undefined behavior if any thread is parked or concurrently parking.
pub unsafe fn deinit() {
    assert_eq!(
        NUM_PARKED.load(Ordering::SeqCst),
        0,
        "deinit with parked threads"
    );
    let mut table = HASHTABLE.swap(ptr::null_mut(), Ordering::SeqCst);
    while !table.is_null() {
        let boxed = unsafe { Box::from_raw(table) };
        table = boxed.prev;
    }
}

fn get_hashtable() -> &'static HashTable {
    let table = HASHTABLE.load(Ordering::Acquire);
    if !table.is_null() {
        return unsafe { &*table };
    }
    create_hashtable()
}

#[cold]
fn create_hashtable() -> &'static HashTable {
    let new_table = Box::into_raw(HashTable::new(16, ptr::null_mut()));
    match HASHTABLE.compare_exchange(
        ptr::null_mut(),
        new_table,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => unsafe { &*new_table },
        Err(old) => {
            // Lost the race; free ours and use the winner's.
            drop(unsafe { Box::from_raw(new_table) });
            unsafe { &*old }
        }
    }
}

#[inline]
fn hash(key: usize, bits: u32) -> usize {
    key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (usize::BITS - bits)
}

/// Lock the bucket for `key`, rechecking that the table was not swapped
/// underneath us.
fn lock_bucket(key: usize) -> &'static Bucket {
    loop {
        let table = get_hashtable();
        let bucket = &table.entries[hash(key, table.hash_bits)];
        bucket.lock.lock();
        if HASHTABLE.load(Ordering::Relaxed) == table as *const _ as *mut _ {
            return bucket;
        }
        unsafe { bucket.lock.unlock() };
    }
}

/// Grow the table when parked threads outnumber a third of the buckets.
fn grow_if_crowded() {
    let parked = NUM_PARKED.load(Ordering::Relaxed);
    let table = get_hashtable();
    if parked <= table.entries.len() / 3 {
        return;
    }
    grow_hashtable(parked);
}

#[cold]
fn grow_hashtable(num_threads: usize) {
    loop {
        let old_ptr = HASHTABLE.load(Ordering::Acquire);
        let old = unsafe { &*old_ptr };
        if old.entries.len() / 3 >= num_threads {
            return;
        }

        // Freeze the old table by locking every bucket.
        for bucket in old.entries.iter() {
            bucket.lock.lock();
        }

        // Someone else may have swapped first.
        if HASHTABLE.load(Ordering::Relaxed) != old_ptr {
            for bucket in old.entries.iter() {
                unsafe { bucket.lock.unlock() };
            }
            continue;
        }

        let new_table = HashTable::new(num_threads, old_ptr);

        // Rehash every parked thread into the new table, preserving
        // FIFO order within each bucket.
        for bucket in old.entries.iter() {
            let mut current = bucket.queue_head.get();
            while !current.is_null() {
                let next = unsafe { (*current).next_in_queue.get() };
                let key = unsafe { (*current).key.load(Ordering::Relaxed) };
                let dest = &new_table.entries[hash(key, new_table.hash_bits)];
                unsafe {
                    (*current).next_in_queue.set(ptr::null());
                }
                if dest.queue_tail.get().is_null() {
                    dest.queue_head.set(current);
                } else {
                    unsafe {
                        (*dest.queue_tail.get()).next_in_queue.set(current);
                    }
                }
                dest.queue_tail.set(current);
                current = next;
            }
            bucket.queue_head.set(ptr::null());
            bucket.queue_tail.set(ptr::null());
        }

        HASHTABLE.store(Box::into_raw(new_table), Ordering::Release);

        for bucket in old.entries.iter() {
            unsafe { bucket.lock.unlock() };
        }
        return;
    }
}

/// Park the current thread on `key`.
///
/// `validate` runs with the bucket locked; returning false aborts the
/// park. `before_sleep` runs after the bucket is unlocked but before the
/// thread sleeps, which is where a caller releases the lock it is
/// waiting against.
pub fn park(
    key: usize,
    validate: impl FnOnce() -> bool,
    before_sleep: impl FnOnce(),
    timeout: Option<Duration>,
) -> ParkResult {
    let deadline = deadline_from(timeout);
    THREAD_DATA.with(|td| park_inner(td, key, validate, before_sleep, deadline))
}

fn park_inner(
    td: &ThreadData,
    key: usize,
    validate: impl FnOnce() -> bool,
    before_sleep: impl FnOnce(),
    deadline: Option<Instant>,
) -> ParkResult {
    grow_if_crowded();

    let bucket = lock_bucket(key);
    if !validate() {
        unsafe { bucket.lock.unlock() };
        return ParkResult::Invalid;
    }

    td.key.store(key, Ordering::Relaxed);
    td.parker.prepare_park();
    td.next_in_queue.set(ptr::null());
    if bucket.queue_tail.get().is_null() {
        bucket.queue_head.set(td);
    } else {
        unsafe {
            (*bucket.queue_tail.get()).next_in_queue.set(td);
        }
    }
    bucket.queue_tail.set(td);
    NUM_PARKED.fetch_add(1, Ordering::Relaxed);
    unsafe { bucket.lock.unlock() };

    before_sleep();

    let unparked = match deadline {
        None => {
            td.parker.park();
            true
        }
        Some(deadline) => td.parker.park_until(deadline),
    };
    if unparked {
        NUM_PARKED.fetch_sub(1, Ordering::Relaxed);
        return ParkResult::Unparked;
    }

    // Timed out: remove ourselves, unless an unparker dequeued us in the
    // window between the timeout and re-locking the bucket. In that case
    // the wake is already on its way and must be absorbed.
    let bucket = lock_bucket(key);
    let mut current = bucket.queue_head.get();
    let mut prev: *const ThreadData = ptr::null();
    let mut found = false;
    while !current.is_null() {
        if ptr::eq(current, td) {
            let next = td.next_in_queue.get();
            if prev.is_null() {
                bucket.queue_head.set(next);
            } else {
                unsafe { (*prev).next_in_queue.set(next) };
            }
            if bucket.queue_tail.get() == td as *const _ {
                bucket.queue_tail.set(prev);
            }
            found = true;
            break;
        }
        prev = current;
        current = unsafe { (*current).next_in_queue.get() };
    }
    unsafe { bucket.lock.unlock() };

    NUM_PARKED.fetch_sub(1, Ordering::Relaxed);
    if found {
        ParkResult::TimedOut
    } else {
        td.parker.park();
        ParkResult::Unparked
    }
}

/// Wake the first thread parked on `key`. The callback observes the
/// result while the bucket is still locked, so it can update lock state
/// atomically with the dequeue.
pub fn unpark_one(key: usize, callback: impl FnOnce(UnparkResult)) -> UnparkResult {
    let bucket = lock_bucket(key);

    let mut current = bucket.queue_head.get();
    let mut prev: *const ThreadData = ptr::null();
    while !current.is_null() {
        if unsafe { (*current).key.load(Ordering::Relaxed) } == key {
            let next = unsafe { (*current).next_in_queue.get() };
            if prev.is_null() {
                bucket.queue_head.set(next);
            } else {
                unsafe { (*prev).next_in_queue.set(next) };
            }
            if bucket.queue_tail.get() == current {
                bucket.queue_tail.set(prev);
            }

            let mut have_more = false;
            let mut scan = next;
            while !scan.is_null() {
                if unsafe { (*scan).key.load(Ordering::Relaxed) } == key {
                    have_more = true;
                    break;
                }
                scan = unsafe { (*scan).next_in_queue.get() };
            }

            let result = UnparkResult {
                unparked: true,
                have_more,
            };
            callback(result);
            unsafe {
                (*current).parker.unpark();
                bucket.lock.unlock();
            }
            return result;
        }
        prev = current;
        current = unsafe { (*current).next_in_queue.get() };
    }

    let result = UnparkResult::default();
    callback(result);
    unsafe { bucket.lock.unlock() };
    result
}

/// Wake every thread parked on `key`; returns how many were woken.
pub fn unpark_all(key: usize) -> usize {
    let bucket = lock_bucket(key);

    let mut woken: Vec<*const ThreadData> = Vec::new();
    let mut current = bucket.queue_head.get();
    let mut prev: *const ThreadData = ptr::null();
    while !current.is_null() {
        let next = unsafe { (*current).next_in_queue.get() };
        if unsafe { (*current).key.load(Ordering::Relaxed) } == key {
            if prev.is_null() {
                bucket.queue_head.set(next);
            } else {
                unsafe { (*prev).next_in_queue.set(next) };
            }
            if bucket.queue_tail.get() == current {
                bucket.queue_tail.set(prev);
            }
            woken.push(current);
        } else {
            prev = current;
        }
        current = next;
    }
    unsafe { bucket.lock.unlock() };

    for td in &woken {
        unsafe { (**td).parker.unpark() };
    }
    woken.len()
}

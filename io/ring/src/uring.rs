//! io_uring backend (Linux).
//!
//! The submission queue is shared between the owning ring and any
//! [`Submitter`](crate::Submitter) handles, serialized by a mutex; the
//! completion queue is consumed only by the owning ring. Child rings are
//! created with `IORING_SETUP_ATTACH_WQ` so they share the parent's
//! kernel worker pool.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use io_uring::types::Fd;
use io_uring::{cqueue, opcode, IoUring};

use crate::completion::{Cqe, CqeFlags};
use crate::error::Error;

pub(crate) struct UringShared {
    ring: IoUring,
    /// Guards all submission-queue access (`submission_shared`).
    sq_lock: parklot::Mutex<()>,
}

// IoUring is Send + Sync; the sq_lock upholds the exclusive-submitter
// contract of `submission_shared`, and only the owning `UringRing`
// touches the completion queue.
unsafe impl Send for UringShared {}
unsafe impl Sync for UringShared {}

impl UringShared {
    pub(crate) fn push(&self, entry: io_uring::squeue::Entry) -> Result<(), Error> {
        let _guard = self.sq_lock.lock();
        // Safety: sq_lock serializes every submission_shared call.
        unsafe {
            let mut sq = self.ring.submission_shared();
            sq.push(&entry).map_err(|_| Error::SubmissionQueueFull)
        }
    }

    pub(crate) fn submit(&self) -> Result<usize, Error> {
        Ok(self.ring.submitter().submit()?)
    }

    fn submit_and_wait(&self, want: usize) -> Result<usize, Error> {
        Ok(self.ring.submitter().submit_and_wait(want)?)
    }
}

/// Probe whether the kernel supports the feature set this backend needs.
pub(crate) fn is_supported() -> bool {
    IoUring::new(2).is_ok()
}

pub(crate) struct UringRing {
    shared: Arc<UringShared>,
}

impl UringRing {
    pub(crate) fn new(entries: u32) -> Result<Self, Error> {
        let ring = IoUring::builder()
            .build(entries)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::ENOSYS) => Error::Unsupported("io_uring not available"),
                _ => Error::Io(e),
            })?;
        Ok(Self {
            shared: Arc::new(UringShared {
                ring,
                sq_lock: parklot::Mutex::new(()),
            }),
        })
    }

    /// Child ring sharing the parent's kernel work queue.
    pub(crate) fn child(&self, entries: u32) -> Result<Self, Error> {
        let ring = IoUring::builder()
            .setup_attach_wq(self.shared.ring.as_raw_fd())
            .build(entries)?;
        Ok(Self {
            shared: Arc::new(UringShared {
                ring,
                sq_lock: parklot::Mutex::new(()),
            }),
        })
    }

    pub(crate) fn handle(&self) -> Arc<UringShared> {
        self.shared.clone()
    }

    pub(crate) fn push(&self, entry: io_uring::squeue::Entry) -> Result<(), Error> {
        self.shared.push(entry)
    }

    pub(crate) fn submit(&self) -> Result<usize, Error> {
        self.shared.submit()
    }

    pub(crate) fn submit_and_wait(&self, want: usize) -> Result<usize, Error> {
        self.shared.submit_and_wait(want)
    }

    pub(crate) fn try_cqe(&mut self) -> Option<Cqe> {
        // Safety: &mut self makes this the only completion-queue reader.
        let mut cq = unsafe { self.shared.ring.completion_shared() };
        cq.next().map(convert_cqe)
    }

    pub(crate) fn wait_cqe(&mut self) -> Result<Cqe, Error> {
        loop {
            if let Some(cqe) = self.try_cqe() {
                return Ok(cqe);
            }
            self.shared.submit_and_wait(1)?;
        }
    }
}

fn convert_cqe(entry: cqueue::Entry) -> Cqe {
    let mut flags = CqeFlags::empty();
    if cqueue::sock_nonempty(entry.flags()) {
        flags |= CqeFlags::SOCK_NONEMPTY;
    }
    Cqe::new(entry.user_data(), entry.result(), flags)
}

// SQE construction helpers shared by UringRing and Submitter.

pub(crate) fn nop_sqe(user_data: u64) -> io_uring::squeue::Entry {
    opcode::Nop::new().build().user_data(user_data)
}

pub(crate) fn accept_sqe(fd: RawFd, user_data: u64) -> io_uring::squeue::Entry {
    opcode::Accept::new(Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
        .build()
        .user_data(user_data)
}

pub(crate) fn recv_sqe(fd: RawFd, buf: *mut u8, len: u32, user_data: u64) -> io_uring::squeue::Entry {
    opcode::Recv::new(Fd(fd), buf, len).build().user_data(user_data)
}

pub(crate) fn send_sqe(
    fd: RawFd,
    buf: *const u8,
    len: u32,
    user_data: u64,
) -> io_uring::squeue::Entry {
    opcode::Send::new(Fd(fd), buf, len).build().user_data(user_data)
}

pub(crate) fn close_sqe(fd: RawFd, user_data: u64) -> io_uring::squeue::Entry {
    opcode::Close::new(Fd(fd)).build().user_data(user_data)
}

pub(crate) fn cancel_sqe(target_user_data: u64, user_data: u64) -> io_uring::squeue::Entry {
    opcode::AsyncCancel::new(target_user_data)
        .build()
        .user_data(user_data)
}

//! poll(2) backend.
//!
//! Completion semantics are emulated with a shared *workgroup*: an
//! interest set of pending operations (slab-allocated nodes), one
//! completion queue per attached ring, and a self-pipe that interrupts a
//! sleeping `poll(2)` whenever another thread stages work or finishes an
//! operation some other ring is waiting on.
//!
//! Any ring that drives the group executes every ready operation it
//! finds, not just its own; results are routed to the owning ring's
//! queue and the pipe is poked so sleeping owners re-check.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use slab::Slab;

use crate::completion::{Cqe, CqeFlags};
use crate::error::Error;

#[derive(Debug)]
pub(crate) enum OpKind {
    Accept { fd: RawFd },
    Recv { fd: RawFd, buf: *mut u8, len: u32 },
    Send { fd: RawFd, buf: *const u8, len: u32 },
}

// The raw buffer pointers must stay valid until the operation completes;
// that contract is on the submitter (same as the uring backend).
unsafe impl Send for OpKind {}

struct PendingOp {
    ring: usize,
    user_data: u64,
    kind: OpKind,
}

/// Operations staged on a ring before `submit` publishes them.
pub(crate) enum Staged {
    Op { kind: OpKind, user_data: u64 },
    Nop { user_data: u64 },
    Close { fd: RawFd, user_data: u64 },
    Cancel { target: u64, user_data: u64 },
}

struct RingState {
    queue: std::collections::VecDeque<Cqe>,
}

struct GroupInner {
    ops: Slab<PendingOp>,
    rings: Slab<RingState>,
}

impl GroupInner {
    fn complete(&mut self, ring: usize, cqe: Cqe) {
        if let Some(state) = self.rings.get_mut(ring) {
            state.queue.push_back(cqe);
        }
    }
}

/// Nonblocking self-pipe used to interrupt `poll(2)`.
struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    fn new() -> Result<Self, Error> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    fn wake(&self) {
        let byte = 1u8;
        // A full pipe already guarantees a pending wake.
        unsafe { libc::write(self.write_fd, &byte as *const u8 as *const _, 1) };
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

pub(crate) struct WorkGroup {
    inner: parklot::Mutex<GroupInner>,
    wake: WakePipe,
}

impl WorkGroup {
    fn new() -> Result<Arc<Self>, Error> {
        Ok(Arc::new(Self {
            inner: parklot::Mutex::new(GroupInner {
                ops: Slab::with_capacity(64),
                rings: Slab::with_capacity(8),
            }),
            wake: WakePipe::new()?,
        }))
    }

    fn attach_ring(&self) -> usize {
        self.inner.lock().rings.insert(RingState {
            queue: std::collections::VecDeque::with_capacity(16),
        })
    }

    /// Publish one staged entry. Nop, close and cancel complete right
    /// here; real socket ops join the interest set.
    fn publish(&self, inner: &mut GroupInner, ring: usize, staged: Staged) {
        match staged {
            Staged::Op { kind, user_data } => {
                inner.ops.insert(PendingOp {
                    ring,
                    user_data,
                    kind,
                });
            }
            Staged::Nop { user_data } => {
                inner.complete(ring, Cqe::new(user_data, 0, CqeFlags::empty()));
            }
            Staged::Close { fd, user_data } => {
                let result = if unsafe { libc::close(fd) } == 0 {
                    0
                } else {
                    -last_errno()
                };
                inner.complete(ring, Cqe::new(user_data, result, CqeFlags::empty()));
            }
            Staged::Cancel { target, user_data } => {
                let victim = inner
                    .ops
                    .iter()
                    .find(|(_, op)| op.ring == ring && op.user_data == target)
                    .map(|(key, _)| key);
                match victim {
                    Some(key) => {
                        let op = inner.ops.remove(key);
                        inner.complete(
                            op.ring,
                            Cqe::new(op.user_data, -libc::ECANCELED, CqeFlags::empty()),
                        );
                        inner.complete(ring, Cqe::new(user_data, 0, CqeFlags::empty()));
                    }
                    None => {
                        inner.complete(
                            ring,
                            Cqe::new(user_data, -libc::ENOENT, CqeFlags::empty()),
                        );
                    }
                }
            }
        }
    }

    /// One poll cycle: snapshot interest, sleep in poll(2) without the
    /// lock, then execute whatever became ready.
    fn drive(&self, ring: usize) -> Result<(), Error> {
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(16);
        pollfds.push(libc::pollfd {
            fd: self.wake.read_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        {
            let inner = self.inner.lock();
            if !inner.rings[ring].queue.is_empty() {
                return Ok(());
            }
            for (_, op) in inner.ops.iter() {
                let (fd, events) = match op.kind {
                    OpKind::Accept { fd } => (fd, libc::POLLIN),
                    OpKind::Recv { fd, .. } => (fd, libc::POLLIN),
                    OpKind::Send { fd, .. } => (fd, libc::POLLOUT),
                };
                pollfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
            }
        }

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                return Ok(());
            }
            return Err(Error::Io(std::io::Error::from_raw_os_error(errno)));
        }

        let mut ready: Vec<(RawFd, libc::c_short)> = Vec::new();
        for pfd in &pollfds[1..] {
            if pfd.revents != 0 {
                ready.push((pfd.fd, pfd.revents));
            }
        }

        let mut inner = self.inner.lock();
        self.wake.drain();

        let mut completed_for_other = false;
        for (fd, revents) in ready {
            // Several ops can share one fd; collect first, then execute.
            let keys: Vec<usize> = inner
                .ops
                .iter()
                .filter(|(_, op)| op_matches(&op.kind, fd, revents))
                .map(|(key, _)| key)
                .collect();
            for key in keys {
                let Some(op) = inner.ops.get(key) else {
                    continue;
                };
                match execute(&op.kind) {
                    ExecResult::Again => {}
                    ExecResult::Done(result) => {
                        let op = inner.ops.remove(key);
                        if op.ring != ring {
                            completed_for_other = true;
                        }
                        inner.complete(op.ring, Cqe::new(op.user_data, result, CqeFlags::empty()));
                    }
                }
            }
        }
        drop(inner);

        if completed_for_other {
            self.wake.wake();
        }
        Ok(())
    }

    fn detach_ring(&self, ring: usize) {
        let mut inner = self.inner.lock();
        let stale: Vec<usize> = inner
            .ops
            .iter()
            .filter(|(_, op)| op.ring == ring)
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            inner.ops.remove(key);
        }
        inner.rings.remove(ring);
    }
}

enum ExecResult {
    Again,
    Done(i32),
}

fn op_matches(kind: &OpKind, fd: RawFd, revents: libc::c_short) -> bool {
    // Error conditions (including a stale fd) run the syscall so the op
    // completes with the real errno instead of polling forever.
    let error = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
    match kind {
        OpKind::Accept { fd: f } | OpKind::Recv { fd: f, .. } => {
            *f == fd && revents & (libc::POLLIN | error) != 0
        }
        OpKind::Send { fd: f, .. } => *f == fd && revents & (libc::POLLOUT | error) != 0,
    }
}

fn execute(kind: &OpKind) -> ExecResult {
    let rc = match *kind {
        OpKind::Accept { fd } => {
            let new_fd =
                unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if new_fd >= 0 {
                unsafe { libc::fcntl(new_fd, libc::F_SETFD, libc::FD_CLOEXEC) };
            }
            new_fd as isize
        }
        OpKind::Recv { fd, buf, len } => unsafe {
            libc::recv(fd, buf as *mut _, len as usize, libc::MSG_DONTWAIT)
        },
        OpKind::Send { fd, buf, len } => unsafe {
            libc::send(
                fd,
                buf as *const _,
                len as usize,
                libc::MSG_DONTWAIT | flags_nosigpipe(),
            )
        },
    };
    if rc >= 0 {
        return ExecResult::Done(rc as i32);
    }
    let errno = last_errno();
    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR {
        ExecResult::Again
    } else {
        ExecResult::Done(-errno)
    }
}

#[cfg(target_os = "linux")]
fn flags_nosigpipe() -> libc::c_int {
    libc::MSG_NOSIGNAL
}

#[cfg(not(target_os = "linux"))]
fn flags_nosigpipe() -> libc::c_int {
    0
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

pub(crate) struct PollRing {
    group: Arc<WorkGroup>,
    ring_id: usize,
    staged: Vec<Staged>,
    entries: usize,
}

impl PollRing {
    pub(crate) fn new(entries: u32) -> Result<Self, Error> {
        let group = WorkGroup::new()?;
        let ring_id = group.attach_ring();
        Ok(Self {
            group,
            ring_id,
            staged: Vec::with_capacity(entries as usize),
            entries: entries as usize,
        })
    }

    pub(crate) fn child(&self, entries: u32) -> Self {
        let ring_id = self.group.attach_ring();
        Self {
            group: self.group.clone(),
            ring_id,
            staged: Vec::with_capacity(entries as usize),
            entries: entries as usize,
        }
    }

    pub(crate) fn handle(&self) -> PollSubmitter {
        PollSubmitter {
            group: self.group.clone(),
            ring_id: self.ring_id,
        }
    }

    pub(crate) fn push(&mut self, staged: Staged) -> Result<(), Error> {
        if self.staged.len() >= self.entries {
            return Err(Error::SubmissionQueueFull);
        }
        self.staged.push(staged);
        Ok(())
    }

    pub(crate) fn submit(&mut self) -> Result<usize, Error> {
        let count = self.staged.len();
        if count > 0 {
            let mut inner = self.group.inner.lock();
            for staged in self.staged.drain(..) {
                self.group.publish(&mut inner, self.ring_id, staged);
            }
            drop(inner);
            self.group.wake.wake();
        }
        Ok(count)
    }

    pub(crate) fn submit_and_wait(&mut self, want: usize) -> Result<usize, Error> {
        let submitted = self.submit()?;
        loop {
            {
                let inner = self.group.inner.lock();
                if inner.rings[self.ring_id].queue.len() >= want {
                    return Ok(submitted);
                }
            }
            self.group.drive(self.ring_id)?;
        }
    }

    pub(crate) fn try_cqe(&mut self) -> Option<Cqe> {
        self.group.inner.lock().rings[self.ring_id].queue.pop_front()
    }

    pub(crate) fn wait_cqe(&mut self) -> Result<Cqe, Error> {
        self.submit()?;
        loop {
            if let Some(cqe) = self.try_cqe() {
                return Ok(cqe);
            }
            self.group.drive(self.ring_id)?;
        }
    }
}

impl Drop for PollRing {
    fn drop(&mut self) {
        self.group.detach_ring(self.ring_id);
    }
}

/// Thread-safe submission handle for a poll-backed ring. Entries publish
/// immediately (there is no kernel queue to batch into).
#[derive(Clone)]
pub(crate) struct PollSubmitter {
    group: Arc<WorkGroup>,
    ring_id: usize,
}

impl PollSubmitter {
    pub(crate) fn push(&self, staged: Staged) -> Result<(), Error> {
        let mut inner = self.group.inner.lock();
        self.group.publish(&mut inner, self.ring_id, staged);
        drop(inner);
        self.group.wake.wake();
        Ok(())
    }
}

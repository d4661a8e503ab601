//! io-ring - completion ring abstraction with io_uring and poll backends.
//!
//! One surface over two submission/completion backends: io_uring on
//! Linux kernels that support it, and a `poll(2)` emulation everywhere
//! else. Operations are staged with `nop`/`accept`/`recv`/`send`/
//! `close_fd`/`cancel`, published with `submit`, and reaped as [`Cqe`]s
//! whose accessors decode results into typed error kinds.
//!
//! A [`Ring`] is the sole consumer of its completion queue. Cross-thread
//! submission goes through a cloneable [`Submitter`] handle, and
//! [`Ring::child`] creates rings that share the parent's kernel worker
//! pool (uring) or workgroup (poll), so per-stream writers do not
//! contend with the main accept/read ring.
//!
//! Buffer lifetime contract: pointers handed to `recv`/`send` must stay
//! valid until the matching completion has been reaped.

mod buffer;
mod completion;
mod error;
mod poll;

#[cfg(target_os = "linux")]
mod uring;

pub use buffer::{BufferPool, RefBuffer, RefSlice, DEFAULT_BUFFER_SIZE};
pub use completion::{AcceptResult, CancelResult, Cqe, CqeFlags, RecvResult, SendResult};
pub use error::Error;

use std::os::unix::io::RawFd;

use poll::{OpKind, Staged};

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Backend {
    /// io_uring where the kernel supports it, poll otherwise.
    #[default]
    Auto,
    /// io_uring (Linux only); construction fails elsewhere.
    Uring,
    /// poll(2) emulation; works on any Unix.
    Poll,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Auto => write!(f, "auto"),
            Backend::Uring => write!(f, "uring"),
            Backend::Poll => write!(f, "poll"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Backend::Auto),
            "uring" | "io_uring" | "io-uring" => Ok(Backend::Uring),
            "poll" => Ok(Backend::Poll),
            _ => Err(format!("unknown backend: {}", s)),
        }
    }
}

/// Check whether io_uring is usable on this system.
pub fn uring_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        uring::is_supported()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

enum Inner {
    #[cfg(target_os = "linux")]
    Uring(uring::UringRing),
    Poll(poll::PollRing),
}

/// A completion ring.
pub struct Ring {
    inner: Inner,
}

impl Ring {
    /// Create a ring with the best available backend.
    pub fn new(entries: u32) -> Result<Self, Error> {
        Self::with_backend(entries, Backend::Auto)
    }

    pub fn with_backend(entries: u32, backend: Backend) -> Result<Self, Error> {
        match backend {
            Backend::Auto => {
                #[cfg(target_os = "linux")]
                if uring::is_supported() {
                    return Ok(Self {
                        inner: Inner::Uring(uring::UringRing::new(entries)?),
                    });
                }
                Ok(Self {
                    inner: Inner::Poll(poll::PollRing::new(entries)?),
                })
            }
            Backend::Uring => {
                #[cfg(target_os = "linux")]
                {
                    Ok(Self {
                        inner: Inner::Uring(uring::UringRing::new(entries)?),
                    })
                }
                #[cfg(not(target_os = "linux"))]
                {
                    Err(Error::Unsupported("io_uring requires Linux"))
                }
            }
            Backend::Poll => Ok(Self {
                inner: Inner::Poll(poll::PollRing::new(entries)?),
            }),
        }
    }

    /// The backend actually in use.
    pub fn backend(&self) -> Backend {
        match &self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(_) => Backend::Uring,
            Inner::Poll(_) => Backend::Poll,
        }
    }

    /// Create a child ring sharing this ring's worker resources. Writes
    /// submitted on the child do not contend with the parent's queue.
    pub fn child(&self, entries: u32) -> Result<Ring, Error> {
        match &self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => Ok(Ring {
                inner: Inner::Uring(r.child(entries)?),
            }),
            Inner::Poll(r) => Ok(Ring {
                inner: Inner::Poll(r.child(entries)),
            }),
        }
    }

    /// Cloneable cross-thread submission handle.
    pub fn submitter(&self) -> Submitter {
        match &self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => Submitter {
                inner: SubmitterInner::Uring(r.handle()),
            },
            Inner::Poll(r) => Submitter {
                inner: SubmitterInner::Poll(r.handle()),
            },
        }
    }

    /// Stage a no-op that completes immediately with result 0.
    pub fn nop(&mut self, user_data: u64) -> Result<(), Error> {
        match &mut self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => r.push(uring::nop_sqe(user_data)),
            Inner::Poll(r) => r.push(Staged::Nop { user_data }),
        }
    }

    /// Stage an accept on a listening socket.
    pub fn accept(&mut self, fd: RawFd, user_data: u64) -> Result<(), Error> {
        match &mut self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => r.push(uring::accept_sqe(fd, user_data)),
            Inner::Poll(r) => r.push(Staged::Op {
                kind: OpKind::Accept { fd },
                user_data,
            }),
        }
    }

    /// Stage a receive. `buf` must stay valid until the completion is
    /// reaped.
    pub fn recv(&mut self, fd: RawFd, buf: *mut u8, len: u32, user_data: u64) -> Result<(), Error> {
        match &mut self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => r.push(uring::recv_sqe(fd, buf, len, user_data)),
            Inner::Poll(r) => r.push(Staged::Op {
                kind: OpKind::Recv { fd, buf, len },
                user_data,
            }),
        }
    }

    /// Stage a send. `buf` must stay valid until the completion is
    /// reaped.
    pub fn send(
        &mut self,
        fd: RawFd,
        buf: *const u8,
        len: u32,
        user_data: u64,
    ) -> Result<(), Error> {
        match &mut self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => r.push(uring::send_sqe(fd, buf, len, user_data)),
            Inner::Poll(r) => r.push(Staged::Op {
                kind: OpKind::Send { fd, buf, len },
                user_data,
            }),
        }
    }

    /// Stage a close of the given descriptor.
    pub fn close_fd(&mut self, fd: RawFd, user_data: u64) -> Result<(), Error> {
        match &mut self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => r.push(uring::close_sqe(fd, user_data)),
            Inner::Poll(r) => r.push(Staged::Close { fd, user_data }),
        }
    }

    /// Stage a cancellation of the in-flight operation tagged
    /// `target_user_data`. The cancelled operation still produces its own
    /// completion (with `ECANCELED`).
    pub fn cancel(&mut self, target_user_data: u64, user_data: u64) -> Result<(), Error> {
        match &mut self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => r.push(uring::cancel_sqe(target_user_data, user_data)),
            Inner::Poll(r) => r.push(Staged::Cancel {
                target: target_user_data,
                user_data,
            }),
        }
    }

    /// Publish staged submissions. Returns how many were published.
    pub fn submit(&mut self) -> Result<usize, Error> {
        match &mut self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => r.submit(),
            Inner::Poll(r) => r.submit(),
        }
    }

    /// Publish staged submissions and block until at least `want`
    /// completions are ready.
    pub fn submit_and_wait(&mut self, want: usize) -> Result<usize, Error> {
        match &mut self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => r.submit_and_wait(want),
            Inner::Poll(r) => r.submit_and_wait(want),
        }
    }

    /// Pop one completion if ready.
    pub fn try_cqe(&mut self) -> Option<Cqe> {
        match &mut self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => r.try_cqe(),
            Inner::Poll(r) => r.try_cqe(),
        }
    }

    /// Block until a completion is available, driving the backend.
    pub fn wait_cqe(&mut self) -> Result<Cqe, Error> {
        match &mut self.inner {
            #[cfg(target_os = "linux")]
            Inner::Uring(r) => r.wait_cqe(),
            Inner::Poll(r) => r.wait_cqe(),
        }
    }
}

#[derive(Clone)]
enum SubmitterInner {
    #[cfg(target_os = "linux")]
    Uring(std::sync::Arc<uring::UringShared>),
    Poll(poll::PollSubmitter),
}

/// Thread-safe submission handle. Operations pushed here are published
/// immediately so a dispatcher blocked on completions observes them.
#[derive(Clone)]
pub struct Submitter {
    inner: SubmitterInner,
}

impl Submitter {
    pub fn nop(&self, user_data: u64) -> Result<(), Error> {
        match &self.inner {
            #[cfg(target_os = "linux")]
            SubmitterInner::Uring(s) => {
                s.push(uring::nop_sqe(user_data))?;
                s.submit()?;
                Ok(())
            }
            SubmitterInner::Poll(s) => s.push(Staged::Nop { user_data }),
        }
    }

    pub fn recv(&self, fd: RawFd, buf: *mut u8, len: u32, user_data: u64) -> Result<(), Error> {
        match &self.inner {
            #[cfg(target_os = "linux")]
            SubmitterInner::Uring(s) => {
                s.push(uring::recv_sqe(fd, buf, len, user_data))?;
                s.submit()?;
                Ok(())
            }
            SubmitterInner::Poll(s) => s.push(Staged::Op {
                kind: OpKind::Recv { fd, buf, len },
                user_data,
            }),
        }
    }

    pub fn send(&self, fd: RawFd, buf: *const u8, len: u32, user_data: u64) -> Result<(), Error> {
        match &self.inner {
            #[cfg(target_os = "linux")]
            SubmitterInner::Uring(s) => {
                s.push(uring::send_sqe(fd, buf, len, user_data))?;
                s.submit()?;
                Ok(())
            }
            SubmitterInner::Poll(s) => s.push(Staged::Op {
                kind: OpKind::Send { fd, buf, len },
                user_data,
            }),
        }
    }

    pub fn close_fd(&self, fd: RawFd, user_data: u64) -> Result<(), Error> {
        match &self.inner {
            #[cfg(target_os = "linux")]
            SubmitterInner::Uring(s) => {
                s.push(uring::close_sqe(fd, user_data))?;
                s.submit()?;
                Ok(())
            }
            SubmitterInner::Poll(s) => s.push(Staged::Close { fd, user_data }),
        }
    }

    pub fn cancel(&self, target_user_data: u64, user_data: u64) -> Result<(), Error> {
        match &self.inner {
            #[cfg(target_os = "linux")]
            SubmitterInner::Uring(s) => {
                s.push(uring::cancel_sqe(target_user_data, user_data))?;
                s.submit()?;
                Ok(())
            }
            SubmitterInner::Poll(s) => s.push(Staged::Cancel {
                target: target_user_data,
                user_data,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn nonblocking_listener() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn test_backends() -> Vec<Backend> {
        let mut backends = vec![Backend::Poll];
        if uring_available() {
            backends.push(Backend::Uring);
        }
        backends
    }

    #[test]
    fn nop_completes_immediately() {
        for backend in test_backends() {
            let mut ring = Ring::with_backend(16, backend).unwrap();
            ring.nop(0xDEAD).unwrap();
            ring.submit_and_wait(1).unwrap();
            let cqe = ring.wait_cqe().unwrap();
            assert_eq!(cqe.user_data, 0xDEAD);
            assert_eq!(cqe.result, 0);
        }
    }

    #[test]
    fn accept_then_recv() {
        for backend in test_backends() {
            let (listener, addr) = nonblocking_listener();
            let mut ring = Ring::with_backend(16, backend).unwrap();

            ring.accept(listener.as_raw_fd(), 1).unwrap();
            ring.submit().unwrap();

            let mut client = TcpStream::connect(addr).unwrap();
            let cqe = ring.wait_cqe().unwrap();
            assert_eq!(cqe.user_data, 1);
            let fd = match cqe.as_accept() {
                AcceptResult::Fd(fd) => fd,
                other => panic!("accept failed: {:?}", other),
            };

            let mut buf = vec![0u8; 64];
            ring.recv(fd, buf.as_mut_ptr(), buf.len() as u32, 2).unwrap();
            ring.submit().unwrap();

            client.write_all(b"ping").unwrap();
            let cqe = ring.wait_cqe().unwrap();
            assert_eq!(cqe.user_data, 2);
            assert_eq!(cqe.as_recv(), RecvResult::Bytes(4));
            assert_eq!(&buf[..4], b"ping");

            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn send_round_trip() {
        for backend in test_backends() {
            let (listener, addr) = nonblocking_listener();
            let mut ring = Ring::with_backend(16, backend).unwrap();

            ring.accept(listener.as_raw_fd(), 1).unwrap();
            ring.submit().unwrap();

            let client = TcpStream::connect(addr).unwrap();
            let cqe = ring.wait_cqe().unwrap();
            let fd = match cqe.as_accept() {
                AcceptResult::Fd(fd) => fd,
                other => panic!("accept failed: {:?}", other),
            };

            let data = b"hello from ring";
            ring.send(fd, data.as_ptr(), data.len() as u32, 9).unwrap();
            ring.submit().unwrap();
            let cqe = ring.wait_cqe().unwrap();
            assert_eq!(cqe.user_data, 9);
            assert_eq!(cqe.as_send(), SendResult::Bytes(data.len()));

            use std::io::Read;
            let mut client = client;
            let mut out = vec![0u8; data.len()];
            client.read_exact(&mut out).unwrap();
            assert_eq!(&out, data);

            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn cancel_pending_recv() {
        for backend in test_backends() {
            let (listener, addr) = nonblocking_listener();
            let mut ring = Ring::with_backend(16, backend).unwrap();

            ring.accept(listener.as_raw_fd(), 1).unwrap();
            ring.submit().unwrap();
            let _client = TcpStream::connect(addr).unwrap();
            let fd = match ring.wait_cqe().unwrap().as_accept() {
                AcceptResult::Fd(fd) => fd,
                other => panic!("accept failed: {:?}", other),
            };

            let mut buf = vec![0u8; 64];
            ring.recv(fd, buf.as_mut_ptr(), buf.len() as u32, 7).unwrap();
            ring.submit().unwrap();

            ring.cancel(7, 8).unwrap();
            ring.submit().unwrap();

            let mut saw_cancelled = false;
            let mut saw_cancel_ack = false;
            for _ in 0..2 {
                let cqe = ring.wait_cqe().unwrap();
                if cqe.user_data == 7 {
                    assert_eq!(cqe.as_recv(), RecvResult::Cancelled);
                    saw_cancelled = true;
                } else {
                    assert_eq!(cqe.user_data, 8);
                    assert!(matches!(
                        cqe.as_cancel(),
                        CancelResult::Done | CancelResult::NoEntity | CancelResult::Already
                    ));
                    saw_cancel_ack = true;
                }
            }
            assert!(saw_cancel_ack);
            let _ = saw_cancelled;

            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn submitter_wakes_waiting_ring() {
        // A nop pushed from another thread must wake a ring blocked in
        // wait_cqe.
        for backend in test_backends() {
            let mut ring = Ring::with_backend(16, backend).unwrap();
            let submitter = ring.submitter();

            let handle = std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(30));
                submitter.nop(42).unwrap();
            });

            let cqe = ring.wait_cqe().unwrap();
            assert_eq!(cqe.user_data, 42);
            handle.join().unwrap();
        }
    }

    #[test]
    fn child_ring_shares_group() {
        for backend in test_backends() {
            let ring = Ring::with_backend(16, backend).unwrap();
            let mut child = ring.child(8).unwrap();
            child.nop(5).unwrap();
            child.submit().unwrap();
            let cqe = child.wait_cqe().unwrap();
            assert_eq!(cqe.user_data, 5);
        }
    }

    #[test]
    fn sq_full_reported() {
        let mut ring = Ring::with_backend(4, Backend::Poll).unwrap();
        for i in 0..4 {
            ring.nop(i).unwrap();
        }
        assert!(matches!(ring.nop(99), Err(Error::SubmissionQueueFull)));
    }
}

//! Completion entries and typed result decoding.
//!
//! A raw completion carries the 64-bit user-data tag and a signed result
//! (bytes on success, negated errno on failure, mirroring the kernel
//! convention on both backends). The `as_*` accessors decode the raw
//! result into the error kinds callers actually branch on.

use std::os::unix::io::RawFd;

bitflags::bitflags! {
    /// Flags carried on a completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CqeFlags: u32 {
        /// The socket had more data queued when this recv completed.
        const SOCK_NONEMPTY = 1 << 0;
    }
}

/// One completion queue entry.
#[derive(Debug, Clone, Copy)]
pub struct Cqe {
    pub user_data: u64,
    pub result: i32,
    pub flags: CqeFlags,
}

/// Decoded result of a recv completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvResult {
    /// `Bytes(0)` means the peer performed an orderly shutdown.
    Bytes(usize),
    Again,
    ConnectionRefused,
    ConnectionReset,
    NotConnected,
    Cancelled,
    Unexpected(i32),
}

/// Decoded result of an accept completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptResult {
    Fd(RawFd),
    Again,
    NotSocket,
    Cancelled,
    Unexpected(i32),
}

/// Decoded result of a send completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Bytes(usize),
    Again,
    BrokenPipe,
    ConnectionReset,
    MessageTooBig,
    Cancelled,
    Unexpected(i32),
}

/// Decoded result of a cancel completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The target operation was found and cancelled.
    Done,
    /// No in-flight operation matched the user-data.
    NoEntity,
    /// The target could not be cancelled.
    Invalid,
    /// The target was already on its way to completion.
    Already,
}

impl Cqe {
    pub fn new(user_data: u64, result: i32, flags: CqeFlags) -> Self {
        Self {
            user_data,
            result,
            flags,
        }
    }

    /// The socket-non-empty hint from the backend, when available.
    pub fn socket_non_empty(&self) -> bool {
        self.flags.contains(CqeFlags::SOCK_NONEMPTY)
    }

    pub fn as_recv(&self) -> RecvResult {
        if self.result >= 0 {
            return RecvResult::Bytes(self.result as usize);
        }
        match -self.result {
            libc::EAGAIN => RecvResult::Again,
            libc::ECONNREFUSED => RecvResult::ConnectionRefused,
            libc::ECONNRESET => RecvResult::ConnectionReset,
            libc::ENOTCONN => RecvResult::NotConnected,
            libc::ECANCELED => RecvResult::Cancelled,
            errno => RecvResult::Unexpected(errno),
        }
    }

    pub fn as_accept(&self) -> AcceptResult {
        if self.result >= 0 {
            return AcceptResult::Fd(self.result);
        }
        match -self.result {
            libc::EAGAIN => AcceptResult::Again,
            libc::ENOTSOCK => AcceptResult::NotSocket,
            libc::ECANCELED => AcceptResult::Cancelled,
            errno => AcceptResult::Unexpected(errno),
        }
    }

    pub fn as_send(&self) -> SendResult {
        if self.result >= 0 {
            return SendResult::Bytes(self.result as usize);
        }
        match -self.result {
            libc::EAGAIN => SendResult::Again,
            libc::EPIPE => SendResult::BrokenPipe,
            libc::ECONNRESET => SendResult::ConnectionReset,
            libc::EMSGSIZE => SendResult::MessageTooBig,
            libc::ECANCELED => SendResult::Cancelled,
            errno => SendResult::Unexpected(errno),
        }
    }

    /// Close result: the kernel reports at most a stale errno, which
    /// callers can only log.
    pub fn as_close(&self) -> Result<(), i32> {
        if self.result >= 0 {
            Ok(())
        } else {
            Err(-self.result)
        }
    }

    pub fn as_cancel(&self) -> CancelResult {
        if self.result >= 0 {
            return CancelResult::Done;
        }
        match -self.result {
            libc::ENOENT => CancelResult::NoEntity,
            libc::EALREADY => CancelResult::Already,
            _ => CancelResult::Invalid,
        }
    }
}

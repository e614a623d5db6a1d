//!
//! Defines the status codes returned across the syscall boundary.

/// Raw code for success. Success is not a `Status`.
pub const OK: i32 = 0;

/// Failure statuses of kernel operations.
///
/// Every variant maps onto a stable negative integer (see [`Status::into_raw`])
/// so that process backends can hand the value straight to sandboxed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Status {
    /// An internal invariant could not be upheld.
    #[error("internal error")]
    Internal,
    #[error("operation not supported")]
    NotSupported,
    #[error("out of kernel resources")]
    NoResources,
    /// The handle arena is exhausted.
    #[error("out of memory")]
    NoMemory,
    #[error("invalid arguments")]
    InvalidArgs,
    /// The handle value does not name a handle in the caller's table.
    #[error("bad handle")]
    BadHandle,
    #[error("wrong object type")]
    WrongType,
    #[error("argument out of range")]
    OutOfRange,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("object is in the wrong state")]
    BadState,
    #[error("timed out")]
    TimedOut,
    /// Nothing is available yet; retry after waiting for a signal.
    #[error("should wait")]
    ShouldWait,
    #[error("canceled")]
    Canceled,
    #[error("peer closed")]
    PeerClosed,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("unavailable")]
    Unavailable,
    /// The handle lacks a right the operation needs.
    #[error("access denied")]
    AccessDenied,
}

impl Status {
    pub const fn into_raw(self) -> i32 {
        match self {
            Status::Internal => -1,
            Status::NotSupported => -2,
            Status::NoResources => -3,
            Status::NoMemory => -4,
            Status::InvalidArgs => -10,
            Status::BadHandle => -11,
            Status::WrongType => -12,
            Status::OutOfRange => -14,
            Status::BufferTooSmall => -15,
            Status::BadState => -20,
            Status::TimedOut => -21,
            Status::ShouldWait => -22,
            Status::Canceled => -23,
            Status::PeerClosed => -24,
            Status::NotFound => -25,
            Status::AlreadyExists => -26,
            Status::Unavailable => -28,
            Status::AccessDenied => -30,
        }
    }

    /// Maps a raw code back to a status. `OK` and unknown codes yield `None`.
    pub fn from_raw(raw: i32) -> Option<Status> {
        let status = match raw {
            -1 => Status::Internal,
            -2 => Status::NotSupported,
            -3 => Status::NoResources,
            -4 => Status::NoMemory,
            -10 => Status::InvalidArgs,
            -11 => Status::BadHandle,
            -12 => Status::WrongType,
            -14 => Status::OutOfRange,
            -15 => Status::BufferTooSmall,
            -20 => Status::BadState,
            -21 => Status::TimedOut,
            -22 => Status::ShouldWait,
            -23 => Status::Canceled,
            -24 => Status::PeerClosed,
            -25 => Status::NotFound,
            -26 => Status::AlreadyExists,
            -28 => Status::Unavailable,
            -30 => Status::AccessDenied,
            _ => return None,
        };
        Some(status)
    }
}

pub type KernelResult<T> = Result<T, Status>;

/// Collapses a result to the raw integer a syscall would return.
pub fn status_of<T>(result: &KernelResult<T>) -> i32 {
    match result {
        Ok(_) => OK,
        Err(status) => status.into_raw(),
    }
}

/// Failure of a channel read.
///
/// On `BUFFER_TOO_SMALL` the sizes of the message at the head of the queue
/// are reported so the caller can retry with a larger buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("channel read failed: {status} (message has {actual_bytes} bytes, {actual_handles} handles)")]
pub struct ReadError {
    pub status: Status,
    pub actual_bytes: u32,
    pub actual_handles: u32,
}

impl From<Status> for ReadError {
    fn from(status: Status) -> Self {
        ReadError { status, actual_bytes: 0, actual_handles: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_are_stable() {
        assert_eq!(Status::BadHandle.into_raw(), -11);
        assert_eq!(Status::AccessDenied.into_raw(), -30);
        assert_eq!(Status::ShouldWait.into_raw(), -22);
        assert_eq!(Status::PeerClosed.into_raw(), -24);
    }

    #[test]
    fn raw_codes_map_back() {
        for status in [Status::Internal, Status::NoMemory, Status::OutOfRange, Status::Unavailable] {
            assert_eq!(Status::from_raw(status.into_raw()), Some(status));
        }
        assert_eq!(Status::from_raw(OK), None);
        assert_eq!(Status::from_raw(-999), None);
    }

    #[test]
    fn status_of_collapses_results() {
        assert_eq!(status_of(&Ok::<_, Status>(5)), OK);
        assert_eq!(status_of::<()>(&Err(Status::TimedOut)), -21);
    }
}

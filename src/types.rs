//!
//! Shared scalar types and ABI constants for the object model.
//!
//! Everything that crosses the simulated syscall boundary is expressed with
//! the aliases below, so that a process instance bridging to a sandboxed
//! program can marshal values without knowing about kernel internals.

/// Kernel object id. Unique for the lifetime of the host process.
pub type Koid = u64;

/// The obfuscated 32-bit value user code holds in place of a handle.
pub type HandleValue = u32;

/// Bitmask of operations a handle may perform. See [`crate::rights`].
pub type Rights = u32;

/// Bitset of asserted object conditions.
pub type Signals = u32;

/// Transaction id occupying the leading four bytes of a channel message.
pub type Txid = u32;

/// Absolute time in nanoseconds on the kernel's monotonic clock.
pub type Time = i64;

pub const KOID_INVALID: Koid = 0;
pub const KOID_FIRST: Koid = 1024;

pub const HANDLE_INVALID: HandleValue = 0;

/// Low bits every valid handle value carries.
pub const HANDLE_FIXED_BITS_MASK: HandleValue = 0b11;

pub const TIME_INFINITE: Time = i64::MAX;
pub const TIME_INFINITE_PAST: Time = i64::MIN;

// channel limits
pub const CHANNEL_MAX_MSG_BYTES: u32 = 65536;
pub const CHANNEL_MAX_MSG_HANDLES: u32 = 64;

// channel read options
pub const CHANNEL_READ_MAY_DISCARD: u32 = 1;

/// Longest object name kept by the kernel; longer names are truncated.
pub const MAX_NAME_LEN: usize = 32;

// Return codes for processes that did not exit on their own.
pub const TASK_RETCODE_SYSCALL_KILL: i64 = -1024;

/// Signal bits. Object-specific names alias the generic `OBJECT_SIGNAL_n` bits.
pub mod signals {
    use super::Signals;

    pub const NONE: Signals = 0;
    pub const OBJECT_SIGNAL_ALL: Signals = 0x00ff_ffff;
    pub const USER_SIGNAL_ALL: Signals = 0xff00_0000;

    pub const OBJECT_READABLE: Signals = 1 << 0;
    pub const OBJECT_WRITABLE: Signals = 1 << 1;
    pub const OBJECT_PEER_CLOSED: Signals = 1 << 2;
    pub const OBJECT_SIGNAL_3: Signals = 1 << 3;
    pub const OBJECT_SIGNAL_4: Signals = 1 << 4;
    pub const OBJECT_SIGNAL_5: Signals = 1 << 5;

    pub const CHANNEL_READABLE: Signals = OBJECT_READABLE;
    pub const CHANNEL_WRITABLE: Signals = OBJECT_WRITABLE;
    pub const CHANNEL_PEER_CLOSED: Signals = OBJECT_PEER_CLOSED;

    pub const PROCESS_TERMINATED: Signals = OBJECT_SIGNAL_3;

    pub const JOB_TERMINATED: Signals = OBJECT_SIGNAL_3;
    pub const JOB_NO_JOBS: Signals = OBJECT_SIGNAL_4;
    pub const JOB_NO_PROCESSES: Signals = OBJECT_SIGNAL_5;
    pub const JOB_NO_CHILDREN: Signals = JOB_NO_JOBS | JOB_NO_PROCESSES;

    pub const PORT_READABLE: Signals = OBJECT_READABLE;
}

/// Kernel object type tags, as reported through `object_get_info` and
/// checked by typed handle dispositions.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ObjType {
    None = 0,
    Process = 1,
    Channel = 4,
    Port = 6,
    Job = 17,
}

impl TryFrom<u32> for ObjType {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjType::None),
            1 => Ok(ObjType::Process),
            4 => Ok(ObjType::Channel),
            6 => Ok(ObjType::Port),
            17 => Ok(ObjType::Job),
            _ => Err(format!("Invalid object type tag: {}", value)),
        }
    }
}

/// What a channel write does with each listed handle.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOp {
    /// Remove the handle from the writer's table and ship it.
    Move = 0,
    /// Ship a duplicate; the writer keeps the original.
    Duplicate = 1,
}

/// One entry of a disposition-based channel write.
///
/// `result` is filled in per entry, so that a batch with one bad handle still
/// tells the caller which one it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleDisposition {
    pub operation: HandleOp,
    pub handle: HandleValue,
    /// `ObjType::None` accepts any type.
    pub obj_type: ObjType,
    /// `rights::SAME_RIGHTS` keeps the source rights.
    pub rights: Rights,
    pub result: i32,
}

impl HandleDisposition {
    /// A move disposition with no type check and unchanged rights.
    pub fn moving(handle: HandleValue) -> Self {
        HandleDisposition {
            operation: HandleOp::Move,
            handle,
            obj_type: ObjType::None,
            rights: crate::rights::SAME_RIGHTS,
            result: 0,
        }
    }

    /// A duplicate disposition with no type check and unchanged rights.
    pub fn duplicating(handle: HandleValue) -> Self {
        HandleDisposition {
            operation: HandleOp::Duplicate,
            ..HandleDisposition::moving(handle)
        }
    }
}

/// A received handle together with what the kernel knows about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub handle: HandleValue,
    pub obj_type: ObjType,
    pub rights: Rights,
}

/// Answer to `object_get_info(HANDLE_BASIC)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HandleBasicInfo {
    pub koid: Koid,
    pub rights: Rights,
    pub obj_type: ObjType,
    pub related_koid: Koid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obj_type_tags_round_trip() {
        for ty in [ObjType::None, ObjType::Process, ObjType::Channel, ObjType::Port, ObjType::Job] {
            assert_eq!(ObjType::try_from(ty as u32), Ok(ty));
        }
        assert!(ObjType::try_from(3).is_err());
    }

    #[test]
    fn job_no_children_covers_both_bits() {
        assert_eq!(signals::JOB_NO_CHILDREN & signals::JOB_NO_JOBS, signals::JOB_NO_JOBS);
        assert_eq!(signals::JOB_NO_CHILDREN & signals::JOB_NO_PROCESSES, signals::JOB_NO_PROCESSES);
    }
}

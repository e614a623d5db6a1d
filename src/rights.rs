//!
//! Rights algebra for handles.
//! Defines the rights bit flags, the default rights each object type is
//! created with, and the subset checks used by duplication and transfer.

use crate::types::Rights;

pub const NONE: Rights = 0;
/// Permission to duplicate the handle.
pub const DUPLICATE: Rights = 1 << 0;
/// Permission to move or duplicate the handle into a channel message.
pub const TRANSFER: Rights = 1 << 1;
pub const READ: Rights = 1 << 2;
pub const WRITE: Rights = 1 << 3;
pub const EXECUTE: Rights = 1 << 4;
pub const MAP: Rights = 1 << 5;
pub const GET_PROPERTY: Rights = 1 << 6;
pub const SET_PROPERTY: Rights = 1 << 7;
pub const ENUMERATE: Rights = 1 << 8;
/// Permission to kill the object (process or job).
pub const DESTROY: Rights = 1 << 9;
pub const SET_POLICY: Rights = 1 << 10;
pub const GET_POLICY: Rights = 1 << 11;
pub const SIGNAL: Rights = 1 << 12;
pub const SIGNAL_PEER: Rights = 1 << 13;
/// Permission to wait on the object's signals.
pub const WAIT: Rights = 1 << 14;
pub const INSPECT: Rights = 1 << 15;
pub const MANAGE_JOB: Rights = 1 << 16;
pub const MANAGE_PROCESS: Rights = 1 << 17;
pub const MANAGE_THREAD: Rights = 1 << 18;
pub const APPLY_PROFILE: Rights = 1 << 19;
pub const MANAGE_SOCKET: Rights = 1 << 20;

/// Sentinel meaning "keep the source handle's rights". Never stored on a handle.
pub const SAME_RIGHTS: Rights = 1 << 31;

// Bits 21-30 are unassigned.
const ASSIGNED: Rights = (1 << 21) - 1;

pub const BASIC: Rights = TRANSFER | DUPLICATE | WAIT | INSPECT;
pub const IO: Rights = READ | WRITE;
pub const PROPERTY: Rights = GET_PROPERTY | SET_PROPERTY;
pub const POLICY: Rights = GET_POLICY | SET_POLICY;

/// Defaults for objects created through the syscall surface.
pub mod defaults {
    use super::*;

    /// Channel endpoints cannot be duplicated, only moved.
    pub const CHANNEL: Rights = (BASIC & !DUPLICATE) | IO | SIGNAL | SIGNAL_PEER;
    pub const PROCESS: Rights =
        BASIC | IO | PROPERTY | ENUMERATE | DESTROY | SIGNAL | MANAGE_PROCESS | MANAGE_THREAD;
    pub const JOB: Rights = BASIC
        | IO
        | PROPERTY
        | POLICY
        | ENUMERATE
        | DESTROY
        | SIGNAL
        | MANAGE_JOB
        | MANAGE_PROCESS
        | MANAGE_THREAD;
    pub const PORT: Rights = (BASIC & !WAIT) | IO;
}

/// Checks if a given rights mask (`have`) satisfies a required mask (`need`).
///
/// # Arguments
/// * `have` - The rights currently held by a handle.
/// * `need` - The rights an operation requires.
///
/// # Returns
/// `true` if every bit of `need` is set in `have`.
#[inline]
pub fn sufficient(have: Rights, need: Rights) -> bool {
    (have & need) == need
}

/// Returns `true` if `requested` grants nothing beyond `have`.
#[inline]
pub fn is_subset(requested: Rights, have: Rights) -> bool {
    (requested & !have) == 0
}

/// Resolves the rights for a derived handle.
///
/// `SAME_RIGHTS` yields `have` unchanged. Any other request must be a subset
/// of `have`, otherwise `None` is returned and the caller reports
/// `INVALID_ARGS`.
#[inline]
pub fn resolve(requested: Rights, have: Rights) -> Option<Rights> {
    if requested == SAME_RIGHTS {
        Some(have)
    } else if is_subset(requested, have) {
        Some(requested)
    } else {
        None
    }
}

/// Rights masks with unassigned bits set are rejected at the syscall boundary.
#[inline]
pub fn is_valid_mask(rights: Rights) -> bool {
    rights == SAME_RIGHTS || (rights & !ASSIGNED) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sufficient_basic() {
        assert!(sufficient(READ, READ));
        assert!(!sufficient(NONE, READ));
        assert!(sufficient(READ | WRITE, READ));
        assert!(!sufficient(READ, READ | WRITE));
        assert!(sufficient(defaults::CHANNEL, IO));
    }

    #[test]
    fn test_resolve_same_rights_keeps_source() {
        assert_eq!(resolve(SAME_RIGHTS, defaults::JOB), Some(defaults::JOB));
    }

    #[test]
    fn test_resolve_rejects_escalation() {
        assert_eq!(resolve(READ, READ | WRITE), Some(READ));
        assert_eq!(resolve(READ | DESTROY, READ | WRITE), None);
        assert_eq!(resolve(NONE, READ), Some(NONE));
    }

    #[test]
    fn test_channel_defaults_exclude_duplicate() {
        assert!(!sufficient(defaults::CHANNEL, DUPLICATE));
        assert!(sufficient(defaults::CHANNEL, TRANSFER | WAIT));
    }

    #[test]
    fn test_mask_validation() {
        assert!(is_valid_mask(SAME_RIGHTS));
        assert!(is_valid_mask(defaults::PROCESS));
        assert!(!is_valid_mask(1 << 25));
        assert!(!is_valid_mask(SAME_RIGHTS | READ));
    }
}

//! Process-wide kernel object id generator.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{Koid, KOID_FIRST};

static NEXT_KOID: AtomicU64 = AtomicU64::new(KOID_FIRST);

/// Returns a fresh koid. Koids are never reused, even across kernel instances.
pub fn generate() -> Koid {
    NEXT_KOID.fetch_add(1, Ordering::Relaxed)
}

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque owner handle. One per active client context; it keys both the
/// engine lock and the per-owner append tail.
#[derive(Eq, PartialEq, Hash, Clone)]
pub struct Session {
    // increase monotonically by 1
    id: u64,
}

impl Session {
    pub fn new() -> Self {
        let id = SESSION_ID.fetch_add(1, Ordering::Relaxed);
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "session-{}", self.id)
    }
}

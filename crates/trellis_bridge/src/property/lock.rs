use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Write-arbitration token for [`super::Property`].
///
/// Not a concurrency primitive: a property locked by one token rejects
/// writes from any other token until the holder writes with a different lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(u64);

impl LockToken {
    pub fn new() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a write with `key` must be rejected while `lock` is held.
pub(crate) fn is_locked(lock: Option<LockToken>, key: Option<LockToken>) -> bool {
    match lock {
        None => false,
        Some(lock) => key != Some(lock),
    }
}

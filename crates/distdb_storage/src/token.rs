//! Continue tokens for paginated sync reads.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Tracks the tokens a store has handed out and not yet seen released.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    next_id: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl TokenRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Issues a token over `[begin, end)`.
    pub fn issue(self: &Arc<Self>, begin: u64, end: u64) -> ContinueToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.lock().insert(id);
        ContinueToken {
            id,
            begin,
            end,
            registry: Arc::downgrade(self),
        }
    }

    /// Returns true if `token` was issued here and is still live.
    pub fn owns(self: &Arc<Self>, token: &ContinueToken) -> bool {
        token
            .registry
            .upgrade()
            .is_some_and(|registry| Arc::ptr_eq(&registry, self))
            && self.live.lock().contains(&token.id)
    }

    /// Number of live tokens.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn release(&self, id: u64) {
        self.live.lock().remove(&id);
    }
}

/// Cursor over an unfinished range scan.
///
/// Dropping the token releases it in the issuing store.
pub struct ContinueToken {
    id: u64,
    begin: u64,
    end: u64,
    registry: Weak<TokenRegistry>,
}

impl ContinueToken {
    /// Next timestamp the scan will read from.
    pub fn begin(&self) -> u64 {
        self.begin
    }

    /// Exclusive upper bound of the scan.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Moves the scan past `last_timestamp`, saturating at `i64::MAX`.
    pub fn advance_past(&mut self, last_timestamp: u64) {
        let max = i64::MAX as u64;
        self.begin = if last_timestamp >= max {
            max
        } else {
            last_timestamp + 1
        };
    }
}

impl fmt::Debug for ContinueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinueToken")
            .field("id", &self.id)
            .field("begin", &self.begin)
            .field("end", &self.end)
            .finish()
    }
}

impl Drop for ContinueToken {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.id);
        }
    }
}

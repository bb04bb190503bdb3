//! Per-session reader/writer exclusion.
//!
//! An index build holds its session's write lock from the first download
//! to the final commit; index queries hold the read lock while loading.
//! Different sessions never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::models::SessionId;

#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionId, Arc<RwLock<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, session: &SessionId) -> Arc<RwLock<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Entries nobody else holds can go; keeps the map bounded by the
        // number of sessions with requests in flight.
        locks.retain(|id, lock| id == session || Arc::strong_count(lock) > 1);
        locks
            .entry(session.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Exclusive access for rebuilding `session`.
    pub async fn write(&self, session: &SessionId) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(session).write_owned().await
    }

    /// Shared access for querying `session`.
    pub async fn read(&self, session: &SessionId) -> OwnedRwLockReadGuard<()> {
        self.lock_for(session).read_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

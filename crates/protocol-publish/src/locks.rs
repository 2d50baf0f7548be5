//! Per-protocol serialization
//!
//! One async mutex per protocol id. Guards are owned so they can move into a
//! spawned commit task and outlive the caller's future.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily created per-protocol locks
#[derive(Debug, Default)]
pub struct ProtocolLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ProtocolLocks {
    /// Create empty lock table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, protocol_id: &str) -> Arc<Mutex<()>> {
        // Clone out of the map so no shard lock is held across an await
        self.locks
            .entry(protocol_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Wait for exclusive access to `protocol_id`
    pub async fn acquire(&self, protocol_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(protocol_id).lock_owned().await
    }

    /// Some caller currently holds `protocol_id`
    #[must_use]
    pub fn is_locked(&self, protocol_id: &str) -> bool {
        self.locks
            .get(protocol_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_protocol_is_exclusive() {
        let locks = Arc::new(ProtocolLocks::new());
        let guard = locks.acquire("P").await;
        assert!(locks.is_locked("P"));

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("P").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(!locks.is_locked("P"));
    }

    #[tokio::test]
    async fn different_protocols_do_not_block() {
        let locks = ProtocolLocks::new();
        let _p = locks.acquire("P").await;
        let _q = locks.acquire("Q").await;
        assert!(locks.is_locked("P"));
        assert!(locks.is_locked("Q"));
    }
}

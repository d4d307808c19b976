//! Per-user advisory locks.
//!
//! At most one credential refresh, one sync and one enrichment batch run per
//! user at a time within this process. Locks for different users or
//! different scopes never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// What the lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    Refresh,
    Sync,
    Enrich,
}

/// Released when dropped.
pub type UserLockGuard = OwnedMutexGuard<()>;

/// Registry of async mutexes keyed by `(scope, user_id)`.
#[derive(Default)]
pub struct UserLocks {
    slots: Mutex<HashMap<(LockScope, i64), Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, scope: LockScope, user_id: i64) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry((scope, user_id))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for the lock.
    pub async fn acquire(&self, scope: LockScope, user_id: i64) -> UserLockGuard {
        self.slot(scope, user_id).lock_owned().await
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, scope: LockScope, user_id: i64) -> Option<UserLockGuard> {
        self.slot(scope, user_id).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_scope_and_user_excludes() {
        let locks = UserLocks::new();
        let held = locks.acquire(LockScope::Sync, 1).await;
        assert!(locks.try_acquire(LockScope::Sync, 1).is_none());
        drop(held);
        assert!(locks.try_acquire(LockScope::Sync, 1).is_some());
    }

    #[tokio::test]
    async fn other_users_and_scopes_do_not_contend() {
        let locks = UserLocks::new();
        let _held = locks.acquire(LockScope::Sync, 1).await;
        assert!(locks.try_acquire(LockScope::Sync, 2).is_some());
        assert!(locks.try_acquire(LockScope::Enrich, 1).is_some());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = Arc::new(UserLocks::new());
        let held = locks.acquire(LockScope::Refresh, 7).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire(LockScope::Refresh, 7).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap();
    }
}

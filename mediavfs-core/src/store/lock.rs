use std::collections::HashSet;
use std::fmt;

use tokio::sync::watch;
use uuid::Uuid;

/// Cooperative reader lock.
///
/// Clients take it while they read a consistent view; indexer writes wait
/// for every holder to release before touching the store.
pub struct ReadLock {
    holders: watch::Sender<HashSet<Uuid>>,
}

impl fmt::Debug for ReadLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadLock")
            .field("holders", &self.holders.borrow().len())
            .finish()
    }
}

impl Default for ReadLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadLock {
    pub fn new() -> Self {
        let (holders, _) = watch::channel(HashSet::new());
        Self { holders }
    }

    pub fn is_locked(&self) -> bool {
        !self.holders.borrow().is_empty()
    }

    /// Take the lock on behalf of `client`. A client holds at most one
    /// share; returns false when it already held the lock.
    pub fn lock(&self, client: Uuid) -> bool {
        self.holders.send_if_modified(|holders| holders.insert(client))
    }

    /// Release `client`'s share. Unknown clients are ignored.
    pub fn unlock(&self, client: Uuid) {
        self.holders
            .send_if_modified(|holders| holders.remove(&client));
    }

    /// Resolves once no holder remains. Immediate when unlocked.
    pub async fn await_unlock(&self) {
        let mut rx = self.holders.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|holders| holders.is_empty()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn unlock_releases_waiters() {
        let lock = Arc::new(ReadLock::new());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(lock.lock(a));
        assert!(lock.lock(b));
        assert!(!lock.lock(a));
        assert!(lock.is_locked());

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.await_unlock().await })
        };

        lock.unlock(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lock.unlock(b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn clients_release_only_their_own_share() {
        let lock = ReadLock::new();
        let (reader, stranger) = (Uuid::new_v4(), Uuid::new_v4());
        lock.lock(reader);
        lock.unlock(stranger);
        assert!(lock.is_locked());
        lock.unlock(reader);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn await_unlock_is_immediate_when_free() {
        let lock = ReadLock::new();
        tokio::time::timeout(Duration::from_millis(100), lock.await_unlock())
            .await
            .expect("no holders");
    }
}

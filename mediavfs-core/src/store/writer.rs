use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use super::{NewItem, Store, StoredItem};
use crate::error::Result;
use crate::item::{Attributes, ItemId, ItemKind};

/// Single logical writer in front of a [`Store`].
///
/// Every write takes one shared async mutex and then waits for the store's
/// reader lock to be released, so writes are serialized and never overlap a
/// client read. Clones share the same gate.
#[derive(Clone)]
pub struct StoreWriter {
    store: Arc<dyn Store>,
    gate: Arc<Mutex<()>>,
}

impl fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreWriter")
            .field("store", &self.store)
            .field("write_in_flight", &self.gate.try_lock().is_err())
            .finish()
    }
}

impl StoreWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Read access; reads are not gated.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn begin(&self) -> MutexGuard<'_, ()> {
        let guard = self.gate.lock().await;
        let lock = self.store.read_lock();
        if lock.is_locked() {
            tracing::debug!("store reader-locked; write deferred");
            lock.await_unlock().await;
        }
        guard
    }

    pub async fn add(&self, item: NewItem) -> Result<StoredItem> {
        let _gate = self.begin().await;
        self.store.add(item).await
    }

    pub async fn update(&self, id: ItemId, mtime: Option<i64>, attrs: &Attributes) -> Result<()> {
        let _gate = self.begin().await;
        self.store.update(id, mtime, attrs).await
    }

    pub async fn update_type(&self, id: ItemId, kind: ItemKind) -> Result<Option<ItemId>> {
        let _gate = self.begin().await;
        self.store.update_type(id, kind).await
    }

    pub async fn relocate(&self, id: ItemId, parent: Option<ItemId>, path: &Path) -> Result<()> {
        let _gate = self.begin().await;
        self.store.relocate(id, parent, path).await
    }

    pub async fn delete(&self, id: ItemId) -> Result<usize> {
        let _gate = self.begin().await;
        self.store.delete(id).await
    }

    pub async fn commit(&self) -> Result<()> {
        let _gate = self.begin().await;
        self.store.commit().await
    }
}

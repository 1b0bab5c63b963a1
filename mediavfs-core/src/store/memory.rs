use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{ItemFilter, NewItem, ReadLock, Store, StoredItem};
use crate::error::{IndexError, Result};
use crate::item::{Attributes, ItemId, ItemKind};

/// Published on every commit that carried changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitNotice {
    pub sequence: u64,
    /// Rows touched since the previous commit.
    pub changes: usize,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    rows: BTreeMap<u64, StoredItem>,
    by_path: HashMap<PathBuf, u64>,
    /// Writes applied to each row id since it was created.
    revisions: HashMap<u64, u64>,
    pending: usize,
    commits: u64,
}

/// In-process [`Store`] used by the daemon and the test suites.
pub struct MemoryStore {
    types: Vec<String>,
    state: Mutex<MemoryState>,
    lock: ReadLock,
    commits: broadcast::Sender<CommitNotice>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("types", &self.types)
            .field("rows", &state.rows.len())
            .field("commits", &state.commits)
            .field("lock", &self.lock)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store whose schema knows every [`ItemKind`].
    pub fn new() -> Self {
        Self::with_types(ItemKind::ALL.iter().map(|kind| kind.as_str().to_string()))
    }

    pub fn with_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (commits, _) = broadcast::channel(64);
        Self {
            types: types.into_iter().map(Into::into).collect(),
            state: Mutex::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
            lock: ReadLock::new(),
            commits,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommitNotice> {
        self.commits.subscribe()
    }

    /// Snapshot of every row ordered by id.
    pub fn rows(&self) -> Vec<StoredItem> {
        self.state.lock().rows.values().cloned().collect()
    }

    pub fn row(&self, path: &Path) -> Option<StoredItem> {
        let state = self.state.lock();
        let id = state.by_path.get(path)?;
        state.rows.get(id).cloned()
    }

    /// Number of writes applied to the row at `path`, counting its insert.
    pub fn revision(&self, path: &Path) -> Option<u64> {
        let state = self.state.lock();
        let id = state.by_path.get(path)?;
        state.revisions.get(id).copied()
    }

    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    fn knows(&self, kind: ItemKind) -> bool {
        self.types
            .iter()
            .any(|name| name.eq_ignore_ascii_case(kind.as_str()))
    }
}

impl MemoryState {
    fn bump(&mut self, id: u64) {
        *self.revisions.entry(id).or_default() += 1;
        self.pending += 1;
    }

    fn subtree(&self, id: u64) -> Vec<u64> {
        let mut out = vec![id];
        let mut cursor = 0;
        while cursor < out.len() {
            let current = out[cursor];
            out.extend(
                self.rows
                    .values()
                    .filter(|row| row.parent.map(|parent| parent.id) == Some(current))
                    .map(|row| row.id.id),
            );
            cursor += 1;
        }
        out
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_object_types(&self) -> Result<Vec<String>> {
        Ok(self.types.clone())
    }

    async fn query(&self, filter: &ItemFilter) -> Result<Vec<StoredItem>> {
        let state = self.state.lock();
        if let Some(path) = &filter.path {
            let hit = state
                .by_path
                .get(path)
                .and_then(|id| state.rows.get(id))
                .filter(|row| filter.matches(row))
                .cloned();
            return Ok(hit.into_iter().collect());
        }
        Ok(state
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn add(&self, item: NewItem) -> Result<StoredItem> {
        if !self.knows(item.kind) {
            return Err(IndexError::SchemaMismatch(item.kind.to_string()));
        }
        let mut state = self.state.lock();
        if state.by_path.contains_key(&item.path) {
            return Err(IndexError::Store(format!(
                "row already exists for {}",
                item.path.display()
            )));
        }
        if let Some(parent) = item.parent
            && !state.rows.contains_key(&parent.id)
        {
            return Err(IndexError::Store(format!("unknown parent {parent}")));
        }

        let id = state.next_id;
        state.next_id += 1;
        let row = StoredItem {
            id: ItemId::new(item.kind, id),
            path: item.path,
            parent: item.parent,
            is_dir: item.is_dir,
            is_overlay: item.is_overlay,
            mtime: item.mtime,
            attrs: item.attrs,
            updated_at: Utc::now(),
        };
        state.by_path.insert(row.path.clone(), id);
        state.rows.insert(id, row.clone());
        state.bump(id);
        Ok(row)
    }

    async fn update(&self, id: ItemId, mtime: Option<i64>, attrs: &Attributes) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .rows
            .get_mut(&id.id)
            .ok_or_else(|| IndexError::Store(format!("no row {id}")))?;
        row.mtime = mtime;
        row.attrs = attrs.clone();
        row.updated_at = Utc::now();
        state.bump(id.id);
        Ok(())
    }

    async fn update_type(&self, id: ItemId, kind: ItemKind) -> Result<Option<ItemId>> {
        if !self.knows(kind) {
            return Ok(None);
        }
        let mut state = self.state.lock();
        let row = state
            .rows
            .get_mut(&id.id)
            .ok_or_else(|| IndexError::Store(format!("no row {id}")))?;
        let migrated = ItemId::new(kind, id.id);
        row.id = migrated;
        row.updated_at = Utc::now();
        for child in state.rows.values_mut() {
            if child.parent.map(|parent| parent.id) == Some(id.id) {
                child.parent = Some(migrated);
            }
        }
        state.bump(id.id);
        Ok(Some(migrated))
    }

    async fn relocate(&self, id: ItemId, parent: Option<ItemId>, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        let old = state
            .rows
            .get(&id.id)
            .map(|row| row.path.clone())
            .ok_or_else(|| IndexError::Store(format!("no row {id}")))?;
        if let Some(existing) = state.by_path.get(path)
            && *existing != id.id
        {
            return Err(IndexError::Store(format!(
                "relocate target occupied: {}",
                path.display()
            )));
        }

        for member in state.subtree(id.id) {
            let Some(row) = state.rows.get_mut(&member) else {
                continue;
            };
            let previous = row.path.clone();
            let suffix = previous.strip_prefix(&old).unwrap_or(Path::new(""));
            row.path = if suffix.as_os_str().is_empty() {
                path.to_path_buf()
            } else {
                path.join(suffix)
            };
            if member == id.id {
                row.parent = parent;
            }
            row.updated_at = Utc::now();
            let updated = row.path.clone();
            state.by_path.remove(&previous);
            state.by_path.insert(updated, member);
            state.bump(member);
        }
        Ok(())
    }

    async fn delete(&self, id: ItemId) -> Result<usize> {
        let mut state = self.state.lock();
        if !state.rows.contains_key(&id.id) {
            return Ok(0);
        }
        let doomed = state.subtree(id.id);
        for member in &doomed {
            if let Some(row) = state.rows.remove(member) {
                state.by_path.remove(&row.path);
            }
            state.revisions.remove(member);
        }
        state.pending += doomed.len();
        Ok(doomed.len())
    }

    async fn commit(&self) -> Result<()> {
        let notice = {
            let mut state = self.state.lock();
            if state.pending == 0 {
                return Ok(());
            }
            state.commits += 1;
            let notice = CommitNotice {
                sequence: state.commits,
                changes: state.pending,
            };
            state.pending = 0;
            notice
        };
        // No subscribers is fine.
        let _ = self.commits.send(notice);
        Ok(())
    }

    fn read_lock(&self) -> &ReadLock {
        &self.lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_row(kind: ItemKind, path: &str, parent: Option<ItemId>) -> NewItem {
        NewItem {
            kind,
            path: PathBuf::from(path),
            parent,
            is_dir: kind == ItemKind::Directory,
            is_overlay: false,
            mtime: Some(1),
            attrs: Attributes::default(),
        }
    }

    #[tokio::test]
    async fn delete_cascades_to_subtree() {
        let store = MemoryStore::new();
        let root = store
            .add(new_row(ItemKind::Directory, "/m", None))
            .await
            .unwrap();
        let sub = store
            .add(new_row(ItemKind::Directory, "/m/sub", Some(root.id)))
            .await
            .unwrap();
        store
            .add(new_row(ItemKind::Audio, "/m/sub/a.mp3", Some(sub.id)))
            .await
            .unwrap();
        store
            .add(new_row(ItemKind::Audio, "/m/b.mp3", Some(root.id)))
            .await
            .unwrap();

        assert_eq!(store.delete(sub.id).await.unwrap(), 2);
        let paths: Vec<_> = store.rows().into_iter().map(|row| row.path).collect();
        assert_eq!(paths, [PathBuf::from("/m"), PathBuf::from("/m/b.mp3")]);
    }

    #[tokio::test]
    async fn relocate_rewrites_descendant_paths() {
        let store = MemoryStore::new();
        let root = store
            .add(new_row(ItemKind::Directory, "/m", None))
            .await
            .unwrap();
        let sub = store
            .add(new_row(ItemKind::Directory, "/m/old", Some(root.id)))
            .await
            .unwrap();
        store
            .add(new_row(ItemKind::Audio, "/m/old/a.mp3", Some(sub.id)))
            .await
            .unwrap();

        store
            .relocate(sub.id, Some(root.id), Path::new("/m/new"))
            .await
            .unwrap();
        assert!(store.row(Path::new("/m/old/a.mp3")).is_none());
        let moved = store.row(Path::new("/m/new/a.mp3")).unwrap();
        assert_eq!(moved.parent, Some(sub.id));
    }

    #[tokio::test]
    async fn update_type_rejects_unknown_schema_types() {
        let store = MemoryStore::with_types(["directory", "file"]);
        let row = store
            .add(new_row(ItemKind::File, "/m/a.mkv", None))
            .await
            .unwrap();
        assert_eq!(store.update_type(row.id, ItemKind::Video).await.unwrap(), None);
        assert!(store.add(new_row(ItemKind::Video, "/m/b.mkv", None)).await.is_err());
    }

    #[tokio::test]
    async fn commit_broadcasts_only_with_changes() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.commit().await.unwrap();
        store
            .add(new_row(ItemKind::Audio, "/m/a.mp3", None))
            .await
            .unwrap();
        store.commit().await.unwrap();

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice, CommitNotice { sequence: 1, changes: 1 });
        assert_eq!(store.commit_count(), 1);
    }
}

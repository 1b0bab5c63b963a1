//! Store collaborator.
//!
//! The storage engine is external; the indexer talks to it through [`Store`].
//! Writes go through [`StoreWriter`], which serializes them and honours the
//! cooperative [`ReadLock`] held by clients.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::item::{Attributes, ItemId, ItemKind};

mod lock;
mod memory;
mod writer;

pub use lock::ReadLock;
pub use memory::{CommitNotice, MemoryStore};
pub use writer::StoreWriter;

/// One persisted row.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredItem {
    pub id: ItemId,
    pub path: PathBuf,
    pub parent: Option<ItemId>,
    pub is_dir: bool,
    pub is_overlay: bool,
    pub mtime: Option<i64>,
    pub attrs: Attributes,
    pub updated_at: DateTime<Utc>,
}

/// Row to insert. The store assigns the id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewItem {
    pub kind: ItemKind,
    pub path: PathBuf,
    pub parent: Option<ItemId>,
    pub is_dir: bool,
    pub is_overlay: bool,
    pub mtime: Option<i64>,
    pub attrs: Attributes,
}

/// Conjunctive row filter. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemFilter {
    pub path: Option<PathBuf>,
    pub parent: Option<ItemId>,
    pub kind: Option<ItemKind>,
    /// Rows strictly below this path.
    pub under: Option<PathBuf>,
}

impl ItemFilter {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn children_of(parent: ItemId) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    pub fn under(path: impl Into<PathBuf>) -> Self {
        Self {
            under: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, row: &StoredItem) -> bool {
        self.path.as_ref().is_none_or(|path| &row.path == path)
            && self.parent.is_none_or(|parent| row.parent == Some(parent))
            && self.kind.is_none_or(|kind| row.id.kind == kind)
            && self
                .under
                .as_ref()
                .is_none_or(|under| row.path != *under && row.path.starts_with(under))
    }
}

/// Typed object database used by the indexer.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    /// Names of the object types the store's schema knows.
    async fn list_object_types(&self) -> Result<Vec<String>>;

    async fn query(&self, filter: &ItemFilter) -> Result<Vec<StoredItem>>;

    async fn add(&self, item: NewItem) -> Result<StoredItem>;

    async fn update(&self, id: ItemId, mtime: Option<i64>, attrs: &Attributes) -> Result<()>;

    /// Migrate a row to another type, keeping its numeric id, path and
    /// children. Returns `None` when the type is not in the schema.
    async fn update_type(&self, id: ItemId, kind: ItemKind) -> Result<Option<ItemId>>;

    /// Move a row (and its descendants) to a new path and parent.
    async fn relocate(&self, id: ItemId, parent: Option<ItemId>, path: &Path) -> Result<()>;

    /// Delete a row and its subtree. Returns the number of rows removed.
    async fn delete(&self, id: ItemId) -> Result<usize>;

    /// Publish pending changes to observers.
    async fn commit(&self) -> Result<()>;

    fn read_lock(&self) -> &ReadLock;

    async fn get_by_path(&self, path: &Path) -> Result<Option<StoredItem>> {
        Ok(self.query(&ItemFilter::path(path)).await?.into_iter().next())
    }

    async fn children(&self, parent: ItemId) -> Result<Vec<StoredItem>> {
        self.query(&ItemFilter::children_of(parent)).await
    }
}

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::listing::{ListingEntry, mtime_ms};

/// Logical object types known to the indexer. The store keeps its own type
/// table; [`ItemKind::as_str`] is the name used to match against it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Directory,
    Image,
    Video,
    Audio,
    File,
    /// Disc structure (DVD/Blu-ray folder or image) holding nested tracks.
    Disc,
    Track,
}

impl ItemKind {
    pub const ALL: [ItemKind; 7] = [
        ItemKind::Directory,
        ItemKind::Image,
        ItemKind::Video,
        ItemKind::Audio,
        ItemKind::File,
        ItemKind::Disc,
        ItemKind::Track,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Directory => "directory",
            ItemKind::Image => "image",
            ItemKind::Video => "video",
            ItemKind::Audio => "audio",
            ItemKind::File => "file",
            ItemKind::Disc => "disc",
            ItemKind::Track => "track",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
    }

    /// Multi-track containers own child track rows.
    pub fn is_container(&self) -> bool {
        matches!(self, ItemKind::Disc)
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store identity: type tag plus numeric row id.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ItemId {
    pub kind: ItemKind,
    pub id: u64,
}

impl ItemId {
    pub fn new(kind: ItemKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Non-owning parent reference. Items never hold their parent, only its id
/// or the path it will be resolved from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentRef {
    /// Top of a crawl root.
    Root,
    Stored(ItemId),
    /// Parent not persisted yet; the parser persists it before the child.
    Unresolved(PathBuf),
}

impl ParentRef {
    pub fn stored_id(&self) -> Option<ItemId> {
        match self {
            ParentRef::Stored(id) => Some(*id),
            _ => None,
        }
    }
}

/// Type-specific attribute bag persisted with every row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attributes {
    pub title: Option<String>,
    /// Representative image (a file path; for embedded art the item itself).
    pub image: Option<PathBuf>,
    /// Directory image set by the author (cover file or extractor) rather
    /// than derived from children.
    pub image_authored: bool,
    /// Playback length in seconds.
    pub length: Option<f64>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub subtype: Option<String>,
    pub track_no: Option<u32>,
    pub extra: BTreeMap<String, String>,
}

/// One nested track reported for a multi-track container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub number: u32,
    pub title: Option<String>,
    pub length: Option<f64>,
}

/// Raw extractor output. An empty bag is what a failed extraction yields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeBag {
    pub kind: Option<ItemKind>,
    pub subtype: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub length: Option<f64>,
    pub image: Option<PathBuf>,
    pub thumbnail: Option<Vec<u8>>,
    pub tracks: Vec<TrackInfo>,
    pub extra: BTreeMap<String, String>,
}

impl AttributeBag {
    pub fn is_empty(&self) -> bool {
        *self == AttributeBag::default()
    }

    pub fn into_attributes(self) -> Attributes {
        Attributes {
            title: self.title,
            image: self.image,
            image_authored: false,
            length: self.length,
            artist: self.artist,
            album: self.album,
            subtype: self.subtype,
            track_no: None,
            extra: self.extra,
        }
    }
}

/// An indexed file or directory.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub id: Option<ItemId>,
    pub path: PathBuf,
    pub parent: ParentRef,
    /// Volume or media label the item lives on, when known.
    pub volume: Option<String>,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub is_overlay: bool,
    /// Last persisted modification signature.
    pub mtime: Option<i64>,
    pub attrs: Attributes,
}

impl Item {
    /// Unpersisted placeholder for a path that has not been stat'ed.
    pub fn placeholder(path: impl Into<PathBuf>, parent: ParentRef, is_dir: bool) -> Self {
        Self {
            id: None,
            path: path.into(),
            parent,
            volume: None,
            is_dir,
            is_symlink: false,
            is_overlay: false,
            mtime: None,
            attrs: Attributes::default(),
        }
    }

    pub fn from_entry(entry: &ListingEntry, parent: ParentRef) -> Self {
        Self {
            id: None,
            path: entry.path.clone(),
            parent,
            volume: None,
            is_dir: entry.is_dir,
            is_symlink: entry.is_symlink,
            is_overlay: entry.is_overlay,
            mtime: None,
            attrs: Attributes::default(),
        }
    }

    /// Stat `path` into an item. Returns `None` when the path vanished.
    pub async fn stat(path: &Path, parent: ParentRef) -> Option<Self> {
        let link = tokio::fs::symlink_metadata(path).await.ok()?;
        let meta = tokio::fs::metadata(path).await.ok()?;
        let mut item = Self::placeholder(path, parent, meta.is_dir());
        item.is_symlink = link.file_type().is_symlink();
        if mtime_ms(&meta).is_none() {
            tracing::debug!(path = %path.display(), "no modification time available");
        }
        Some(item)
    }

    pub fn name(&self) -> Cow<'_, str> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| self.path.to_string_lossy())
    }

    /// Lowercased extension, if any.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.path)
    }

    pub fn kind(&self) -> Option<ItemKind> {
        self.id.map(|id| id.kind)
    }
}

pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

/// Dot-prefixed final component.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

//! Per-item parse pipeline.
//!
//! [`Parser::parse`] decides whether an item changed since it was last
//! persisted, runs the extractor when it did, keeps thumbnails fresh and
//! upserts the row. Multi-track containers get one child row per track.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::CrawlerConfig;
use crate::item::{Attributes, Item, ItemId, ItemKind, ParentRef, TrackInfo, extension_of};
use crate::listing::{ListingEntry, mtime_ms, read_listing};
use crate::roots::RootSet;
use crate::store::{ItemFilter, NewItem, StoreWriter};

mod enrich;
mod extract;
#[cfg(feature = "ffmpeg")]
mod ffmpeg;
mod signature;
mod thumbnail;
mod title;

pub use enrich::{Enricher, EnricherRegistry, SidecarSubtitleEnricher};
pub use extract::{
    DEFAULT_AUDIO_FILE_EXTENSIONS, DEFAULT_IMAGE_FILE_EXTENSIONS, DEFAULT_VIDEO_FILE_EXTENSIONS,
    DiscLayout, ExtensionExtractor, Extractor, disc_layout,
};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegExtractor;
pub use signature::signature;
pub use thumbnail::{
    NullThumbnailer, ThumbPriority, ThumbSize, ThumbnailCache, ThumbnailRequest, Thumbnailer,
};
pub use title::{split_track_prefix, title_from_path};

/// Work performed by one parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ParseLoad {
    /// Signature unchanged, nothing extracted.
    Idle = 0,
    Extracted = 1,
    /// A thumbnail was (re)requested.
    Thumbnailed = 2,
}

/// Cheap to clone; clones share collaborators and the cached type table.
#[derive(Clone)]
pub struct Parser {
    writer: StoreWriter,
    extractor: Arc<dyn Extractor>,
    thumbnailer: Arc<dyn Thumbnailer>,
    enrichers: Arc<EnricherRegistry>,
    roots: RootSet,
    cover_names: Arc<Vec<String>>,
    overlay_root: Option<Arc<PathBuf>>,
    known_types: Arc<OnceCell<Vec<String>>>,
}

impl fmt::Debug for Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parser")
            .field("writer", &self.writer)
            .field("extractor", &self.extractor)
            .field("thumbnailer", &self.thumbnailer)
            .field("enrichers", &self.enrichers)
            .field("roots", &self.roots.all())
            .field("overlay_root", &self.overlay_root)
            .finish()
    }
}

impl Parser {
    pub fn new(
        writer: StoreWriter,
        extractor: Arc<dyn Extractor>,
        thumbnailer: Arc<dyn Thumbnailer>,
    ) -> Self {
        let defaults = CrawlerConfig::default();
        Self {
            writer,
            extractor,
            thumbnailer,
            enrichers: Arc::new(EnricherRegistry::new()),
            roots: RootSet::new(),
            cover_names: Arc::new(defaults.cover_names),
            overlay_root: None,
            known_types: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_enrichers(mut self, enrichers: EnricherRegistry) -> Self {
        self.enrichers = Arc::new(enrichers);
        self
    }

    /// Adopt the cover names and overlay root of a crawler configuration.
    pub fn configured_by(mut self, config: &CrawlerConfig) -> Self {
        self.cover_names = Arc::new(config.cover_names.clone());
        self.overlay_root = config.overlay_root.clone().map(Arc::new);
        self
    }

    pub fn writer(&self) -> &StoreWriter {
        &self.writer
    }

    /// Registered crawl roots; parent persistence stops at these.
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    pub fn overlay_root(&self) -> Option<&Path> {
        self.overlay_root.as_deref().map(PathBuf::as_path)
    }

    pub fn is_cover_name(&self, name: &str) -> bool {
        self.cover_names
            .iter()
            .any(|cover| cover.eq_ignore_ascii_case(name))
    }

    /// Parse one item, reading its directory for sidecars.
    pub async fn parse(&self, item: &mut Item, force_thumbnail_check: bool) -> ParseLoad {
        self.parse_with_listing(item, force_thumbnail_check, None)
            .await
    }

    /// Parse one item. `siblings` is the merged listing of the item's parent
    /// directory when the caller already holds it.
    pub async fn parse_with_listing(
        &self,
        item: &mut Item,
        force_thumbnail_check: bool,
        siblings: Option<&[ListingEntry]>,
    ) -> ParseLoad {
        let owned_siblings;
        let siblings: &[ListingEntry] = match siblings {
            Some(listing) => listing,
            None if item.is_dir => &[],
            None => {
                owned_siblings = match item.path.parent() {
                    Some(dir) => read_listing(dir, self.overlay_root()).await.unwrap_or_default(),
                    None => Vec::new(),
                };
                &owned_siblings
            }
        };

        if item.id.is_none() {
            match self.writer.store().get_by_path(&item.path).await {
                Ok(Some(row)) => {
                    item.id = Some(row.id);
                    item.mtime = row.mtime;
                    item.attrs = row.attrs;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %item.path.display(), error = %err, "store lookup failed");
                    return ParseLoad::Idle;
                }
            }
        }

        let Some(sig) = signature(&item.path, item.is_dir, siblings).await else {
            self.forget(item).await;
            return ParseLoad::Idle;
        };

        if !self.resolve_parent(item).await {
            return ParseLoad::Idle;
        }

        if let Some(id) = item.id
            && item.mtime == Some(sig)
        {
            if !force_thumbnail_check {
                return ParseLoad::Idle;
            }
            return match item.attrs.image.clone() {
                Some(image) => {
                    let still_frame = id.kind == ItemKind::Video && image == item.path;
                    if self.ensure_thumbnail(&image, still_frame).await {
                        ParseLoad::Thumbnailed
                    } else {
                        ParseLoad::Idle
                    }
                }
                None => ParseLoad::Idle,
            };
        }

        self.extract_and_store(item, sig, siblings).await
    }

    async fn extract_and_store(
        &self,
        item: &mut Item,
        sig: i64,
        siblings: &[ListingEntry],
    ) -> ParseLoad {
        let mut bag = self.extractor.extract(&item.path, item.is_dir).await;
        if bag.is_empty() {
            debug!(path = %item.path.display(), "extractor returned nothing");
        }
        let kind = bag.kind.unwrap_or(if item.is_dir {
            ItemKind::Directory
        } else {
            ItemKind::File
        });

        if !self.is_known_type(kind).await {
            warn!(path = %item.path.display(), kind = %kind, "object type missing from store schema; item left stale");
            return ParseLoad::Idle;
        }

        if let Some(id) = item.id
            && id.kind != kind
        {
            match self.writer.update_type(id, kind).await {
                Ok(Some(migrated)) => {
                    debug!(path = %item.path.display(), from = %id.kind, to = %kind, "migrated object type");
                    item.id = Some(migrated);
                }
                Ok(None) => {
                    warn!(path = %item.path.display(), kind = %kind, "type migration rejected; item left stale");
                    return ParseLoad::Idle;
                }
                Err(err) => {
                    warn!(path = %item.path.display(), error = %err, "type migration failed; item left stale");
                    return ParseLoad::Idle;
                }
            }
        }

        let embedded = bag.thumbnail.take();
        let tracks = std::mem::take(&mut bag.tracks);
        let previous = std::mem::take(&mut item.attrs);
        let mut attrs = bag.into_attributes();
        let mut thumbnailed = false;

        match kind {
            ItemKind::Directory | ItemKind::Disc if item.is_dir => {
                self.directory_attributes(item, &previous, &mut attrs).await;
            }
            ItemKind::Image => {
                attrs.image = Some(item.path.clone());
                if let Some(bytes) = embedded {
                    thumbnailed |= self.store_embedded(&item.path, &bytes);
                }
            }
            ItemKind::Audio | ItemKind::Video | ItemKind::Disc => {
                if let Some(bytes) = embedded {
                    thumbnailed |= self.store_embedded(&item.path, &bytes);
                    attrs.image = Some(item.path.clone());
                } else if let Some(sidecar) = sibling_image(&item.path, siblings) {
                    attrs.image = Some(sidecar);
                } else if kind == ItemKind::Video {
                    attrs.image = Some(item.path.clone());
                }
            }
            ItemKind::Directory | ItemKind::File | ItemKind::Track => {}
        }

        if let Some(image) = attrs.image.clone()
            && kind != ItemKind::Image
        {
            let still_frame = kind == ItemKind::Video && image == item.path;
            thumbnailed |= self.ensure_thumbnail(&image, still_frame).await;
        } else if kind == ItemKind::Image {
            thumbnailed |= self.ensure_thumbnail(&item.path, false).await;
        }

        self.fill_title(item, kind, &mut attrs);

        if let Some(ext) = item.extension() {
            for enricher in self.enrichers.for_extension(&ext) {
                enricher.enrich(item, &mut attrs, siblings).await;
            }
        }

        let id = match item.id {
            Some(id) => {
                if let Err(err) = self.writer.update(id, Some(sig), &attrs).await {
                    warn!(path = %item.path.display(), error = %err, "store update failed");
                    item.attrs = previous;
                    return ParseLoad::Idle;
                }
                id
            }
            None => {
                let row = NewItem {
                    kind,
                    path: item.path.clone(),
                    parent: item.parent.stored_id(),
                    is_dir: item.is_dir,
                    is_overlay: item.is_overlay,
                    mtime: Some(sig),
                    attrs: attrs.clone(),
                };
                match self.writer.add(row).await {
                    Ok(row) => row.id,
                    Err(err) => {
                        warn!(path = %item.path.display(), error = %err, "store insert failed");
                        return ParseLoad::Idle;
                    }
                }
            }
        };
        item.id = Some(id);
        item.mtime = Some(sig);
        item.attrs = attrs;

        if kind.is_container() {
            self.replace_tracks(item, id, sig, &tracks).await;
        }

        if thumbnailed {
            ParseLoad::Thumbnailed
        } else {
            ParseLoad::Extracted
        }
    }

    /// Directories keep their rolled-up fields; an image comes from the
    /// extractor or a conventional cover file and is then authored.
    async fn directory_attributes(&self, item: &Item, previous: &Attributes, attrs: &mut Attributes) {
        attrs.length = previous.length;
        attrs.artist = previous.artist.clone();
        attrs.album = previous.album.clone();

        if attrs.image.is_some() {
            attrs.image_authored = true;
            return;
        }
        if let Some(cover) = self.find_cover(&item.path).await {
            attrs.image = Some(cover);
            attrs.image_authored = true;
        } else if !previous.image_authored {
            // Derived by rollup; rollup revises it.
            attrs.image = previous.image.clone();
        }
    }

    async fn find_cover(&self, dir: &Path) -> Option<PathBuf> {
        let listing = match read_listing(dir, self.overlay_root()).await {
            Ok(listing) => listing,
            Err(err) => {
                debug!(path = %dir.display(), error = %err, "cover lookup skipped");
                return None;
            }
        };
        // Configured order is preference order.
        self.cover_names.iter().find_map(|cover| {
            listing
                .iter()
                .find(|entry| !entry.is_dir && entry.name.eq_ignore_ascii_case(cover))
                .map(|entry| entry.path.clone())
        })
    }

    fn fill_title(&self, item: &Item, kind: ItemKind, attrs: &mut Attributes) {
        if attrs.track_no.is_none() {
            attrs.track_no = attrs.extra.get("track").and_then(|raw| raw.parse().ok());
        }
        if attrs.title.is_some() {
            return;
        }
        let synthesized = title_from_path(&item.path, item.is_dir);
        if kind == ItemKind::Audio
            && let Some((number, rest)) = split_track_prefix(&synthesized)
        {
            attrs.track_no.get_or_insert(number);
            attrs.title = Some(rest);
            return;
        }
        attrs.title = Some(synthesized);
    }

    fn store_embedded(&self, image: &Path, bytes: &[u8]) -> bool {
        if self.thumbnailer.is_fresh(image, ThumbSize::Large, None) {
            return false;
        }
        match self.thumbnailer.store_embedded(image, ThumbSize::Large, bytes) {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %image.display(), error = %err, "storing embedded thumbnail failed");
                false
            }
        }
    }

    /// Request a large thumbnail unless one newer than the image exists.
    async fn ensure_thumbnail(&self, image: &Path, still_frame: bool) -> bool {
        let check_mtime = tokio::fs::metadata(image)
            .await
            .ok()
            .and_then(|meta| mtime_ms(&meta));
        if self
            .thumbnailer
            .is_fresh(image, ThumbSize::Large, check_mtime)
        {
            return false;
        }
        self.thumbnailer.create(ThumbnailRequest {
            source: image.to_path_buf(),
            size: ThumbSize::Large,
            priority: ThumbPriority::Low,
            still_frame,
            check_mtime,
        });
        true
    }

    async fn replace_tracks(&self, item: &Item, id: ItemId, sig: i64, tracks: &[TrackInfo]) {
        let filter = ItemFilter::children_of(id).with_kind(ItemKind::Track);
        match self.writer.store().query(&filter).await {
            Ok(stale) => {
                for row in stale {
                    if let Err(err) = self.writer.delete(row.id).await {
                        warn!(path = %row.path.display(), error = %err, "deleting stale track failed");
                    }
                }
            }
            Err(err) => {
                warn!(path = %item.path.display(), error = %err, "listing stale tracks failed");
                return;
            }
        }

        for track in tracks {
            let attrs = Attributes {
                title: track.title.clone(),
                length: track.length,
                track_no: Some(track.number),
                ..Attributes::default()
            };
            let row = NewItem {
                kind: ItemKind::Track,
                path: track_path(&item.path, track.number),
                parent: Some(id),
                is_dir: false,
                is_overlay: false,
                mtime: Some(sig),
                attrs,
            };
            if let Err(err) = self.writer.add(row).await {
                warn!(path = %item.path.display(), track = track.number, error = %err, "inserting track failed");
            }
        }
    }

    /// Make sure the item's parent has store identity.
    async fn resolve_parent(&self, item: &mut Item) -> bool {
        let parent_path = match &item.parent {
            ParentRef::Stored(_) => return true,
            ParentRef::Root => {
                if self.roots.contains(&item.path) {
                    return true;
                }
                match item.path.parent() {
                    Some(parent) => parent.to_path_buf(),
                    None => return true,
                }
            }
            ParentRef::Unresolved(path) => path.clone(),
        };

        if self.roots.contains(&item.path) || self.roots.root_of(&item.path).is_none() {
            item.parent = ParentRef::Root;
            return true;
        }

        match self.persist_parent(&parent_path).await {
            Some(id) => {
                item.parent = ParentRef::Stored(id);
                true
            }
            None => {
                debug!(path = %item.path.display(), parent = %parent_path.display(), "parent could not be persisted");
                false
            }
        }
    }

    /// Persist `dir` (and, recursively, its ancestors up to the root).
    fn persist_parent<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Option<ItemId>> {
        async move {
            match self.writer.store().get_by_path(dir).await {
                Ok(Some(row)) => return Some(row.id),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "store lookup failed");
                    return None;
                }
            }
            let parent = match dir.parent() {
                Some(above) if !self.roots.contains(dir) => ParentRef::Unresolved(above.to_path_buf()),
                _ => ParentRef::Root,
            };
            let mut item = Item::stat(dir, parent).await?;
            self.parse(&mut item, false).await;
            item.id
        }
        .boxed()
    }

    /// Drop a vanished item from the store.
    async fn forget(&self, item: &mut Item) {
        let Some(id) = item.id.take() else {
            return;
        };
        debug!(path = %item.path.display(), "item vanished; removing");
        if let Err(err) = self.writer.delete(id).await {
            warn!(path = %item.path.display(), error = %err, "removing vanished item failed");
        }
    }

    async fn is_known_type(&self, kind: ItemKind) -> bool {
        let types = self
            .known_types
            .get_or_try_init(|| async { self.writer.store().list_object_types().await })
            .await;
        match types {
            Ok(types) => types
                .iter()
                .any(|name| name.eq_ignore_ascii_case(kind.as_str())),
            Err(err) => {
                warn!(error = %err, "reading store type table failed");
                false
            }
        }
    }
}

/// Image sharing the media file's base name (`film.jpg`) or full name
/// (`film.mkv.jpg`).
fn sibling_image(path: &Path, siblings: &[ListingEntry]) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_string_lossy().into_owned();
    let name = path.file_name()?.to_string_lossy().into_owned();
    siblings
        .iter()
        .filter(|entry| !entry.is_dir && entry.path != path)
        .filter(|entry| {
            extension_of(&entry.path)
                .is_some_and(|ext| DEFAULT_IMAGE_FILE_EXTENSIONS.contains(&ext.as_str()))
        })
        .find(|entry| {
            Path::new(&entry.name)
                .file_stem()
                .is_some_and(|candidate| candidate == stem.as_str() || candidate == name.as_str())
        })
        .map(|entry| entry.path.clone())
}

/// Synthetic path of a nested track: `<container>#NN`.
pub fn track_path(container: &Path, number: u32) -> PathBuf {
    let mut raw = OsString::from(container.as_os_str());
    raw.push(format!("#{number:02}"));
    PathBuf::from(raw)
}

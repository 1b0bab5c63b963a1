//! Directory crawling.
//!
//! Each registered root owns a deduplicated [`ScanQueue`] drained by one
//! background task at a time. The drain loop paces itself through the
//! [`Scheduler`], lists each directory merged with its overlay, hands files
//! to the [`Parser`] and enqueues subdirectories. Once a directory has no
//! outstanding subdirectory scans its attributes are rolled up and changes
//! bubble towards the root.
//!
//! Live change notifications enter through [`Crawler::notify`]; see the
//! `events` module for how they are reconciled.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::CrawlerConfig;
use crate::error::{IndexError, Result};
use crate::item::{Item, ItemKind, ParentRef};
use crate::listing::{ListingCache, ListingEntry};
use crate::parser::Parser;
use crate::scheduler::{Policy, Scheduler};
use crate::store::StoredItem;
use crate::watch::{WatchBackend, WatchEvent, WatchTable};

mod events;
mod queue;
pub mod rollup;

pub use queue::{ScanQueue, ScanRequest};

/// Lifecycle of one root's drain task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RootPhase {
    #[default]
    Idle,
    Draining,
    /// Periodic full pass for roots without live notifications.
    Restarting,
}

#[derive(Debug, Default)]
struct RootState {
    queue: ScanQueue,
    phase: RootPhase,
    restart_pending: bool,
}

#[derive(Debug, Default)]
struct CrawlState {
    roots: HashMap<PathBuf, RootState>,
    /// Subdirectory scans whose completion is owed to their parent.
    pending: HashSet<PathBuf>,
    /// Directory -> subdirectory scans it still waits for.
    outstanding: HashMap<PathBuf, usize>,
    watches: WatchTable,
}

pub(crate) struct CrawlerInner {
    parser: Parser,
    scheduler: Scheduler,
    backend: Option<Arc<dyn WatchBackend>>,
    config: CrawlerConfig,
    policy: Policy,
    state: Mutex<CrawlState>,
    listings: ListingCache,
    /// FIFO gate for live events.
    event_gate: tokio::sync::Mutex<()>,
    /// Growing files -> deadline of their quiet window.
    growth: Mutex<HashMap<PathBuf, tokio::time::Instant>>,
    /// Number of running drain tasks.
    busy: watch::Sender<usize>,
    cancel: CancellationToken,
}

/// Crawls registered roots into the store. Clones share one crawler.
#[derive(Clone)]
pub struct Crawler {
    inner: Arc<CrawlerInner>,
}

impl fmt::Debug for Crawler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Crawler")
            .field("policy", &self.inner.policy)
            .field("roots", &state.roots.len())
            .field("watches", &state.watches.len())
            .field("live_backend", &self.inner.backend.is_some())
            .field("stopped", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl Crawler {
    /// `backend` is `None` when no live notification source exists; roots
    /// are then re-crawled periodically.
    pub fn new(
        parser: Parser,
        scheduler: Scheduler,
        backend: Option<Arc<dyn WatchBackend>>,
        config: CrawlerConfig,
        policy: Policy,
    ) -> Self {
        let parser = parser.configured_by(&config);
        let (busy, _) = watch::channel(0);
        Self {
            inner: Arc::new(CrawlerInner {
                listings: ListingCache::new(config.listing_ttl()),
                parser,
                scheduler,
                backend,
                config,
                policy,
                state: Mutex::new(CrawlState::default()),
                event_gate: tokio::sync::Mutex::new(()),
                growth: Mutex::new(HashMap::new()),
                busy,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Register `path` as a permanent root, parse it and queue a recursive,
    /// thumbnail-checking crawl.
    ///
    /// An unreadable root is the only error the crawler reports.
    pub async fn append(&self, path: impl AsRef<Path>) -> Result<()> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(IndexError::Stopped);
        }
        let root = path.as_ref().to_path_buf();
        let unreadable = |source| IndexError::RootUnreadable {
            path: root.clone(),
            source,
        };
        let meta = tokio::fs::metadata(&root).await.map_err(unreadable)?;
        if !meta.is_dir() {
            return Err(unreadable(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                "crawl root is not a directory",
            )));
        }
        drop(tokio::fs::read_dir(&root).await.map_err(unreadable)?);

        if !inner.parser.roots().insert(root.clone()) {
            debug!(path = %root.display(), "root already registered; rescanning");
        }
        inner.state.lock().roots.entry(root.clone()).or_default();

        if let Some(mut item) = Item::stat(&root, ParentRef::Root).await {
            inner.parser.parse(&mut item, true).await;
        }
        inner.enqueue(ScanRequest::new(root.clone(), true, true), false);
        info!(path = %root.display(), policy = %inner.policy, "crawl root registered");
        Ok(())
    }

    /// Cancel in-flight work, clear every queue and tear down watches.
    /// Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }
        inner.cancel.cancel();

        let live = {
            let mut state = inner.state.lock();
            for root in state.roots.values_mut() {
                root.queue.clear();
                root.restart_pending = false;
            }
            state.pending.clear();
            state.outstanding.clear();
            state.watches.clear()
        };
        if let Some(backend) = &inner.backend {
            for dir in &live {
                backend.unwatch(dir);
            }
        }
        inner.growth.lock().clear();
        inner.listings.clear();
        info!(unwatched = live.len(), "crawler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once every root's queue has drained, or the crawler stopped.
    pub async fn wait_idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => {}
            _ = busy.wait_for(|running| *running == 0) => {}
        }
    }

    /// Reconcile one live change notification with the store.
    pub async fn notify(&self, event: WatchEvent) {
        Arc::clone(&self.inner).notify(event).await;
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.inner.parser.roots().all()
    }

    /// Scans waiting across every root.
    pub fn queued(&self) -> usize {
        self.inner
            .state
            .lock()
            .roots
            .values()
            .map(|root| root.queue.len())
            .sum()
    }

    pub fn phase(&self, root: &Path) -> Option<RootPhase> {
        self.inner.state.lock().roots.get(root).map(|r| r.phase)
    }

    /// Snapshot of the watch table.
    pub fn watches(&self) -> WatchTable {
        self.inner.state.lock().watches.clone()
    }

    pub fn parser(&self) -> &Parser {
        &self.inner.parser
    }
}

impl CrawlerInner {
    fn enqueue(self: &Arc<Self>, request: ScanRequest, front: bool) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(root) = self.parser.roots().root_of(&request.directory) else {
            debug!(path = %request.directory.display(), "scan outside every root ignored");
            return;
        };
        let start = {
            let mut state = self.state.lock();
            let root_state = state.roots.entry(root.clone()).or_default();
            root_state.queue.push(request, front);
            if root_state.phase == RootPhase::Idle {
                root_state.phase = RootPhase::Draining;
                true
            } else {
                false
            }
        };
        if start {
            self.start_drain(root);
        }
    }

    fn start_drain(self: &Arc<Self>, root: PathBuf) {
        self.busy.send_modify(|running| *running += 1);
        tokio::spawn(Arc::clone(self).drain(root));
    }

    async fn drain(self: Arc<Self>, root: PathBuf) {
        debug!(root = %root.display(), "drain started");
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.roots.get_mut(&root) {
                    Some(root_state) => match root_state.queue.pop() {
                        Some(request) => {
                            let multiplier = if root_state.phase == RootPhase::Restarting {
                                self.config.restart_multiplier
                            } else {
                                1.0
                            };
                            Some((request, multiplier))
                        }
                        None => {
                            root_state.phase = RootPhase::Idle;
                            None
                        }
                    },
                    None => None,
                }
            };
            let Some((request, multiplier)) = next else {
                break;
            };

            let delay = self.scheduler.pace(self.policy, multiplier);
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.process(request).await;
        }

        if self.cancel.is_cancelled()
            && let Some(root_state) = self.state.lock().roots.get_mut(&root)
        {
            root_state.phase = RootPhase::Idle;
        }
        debug!(root = %root.display(), "drain finished");
        self.busy.send_modify(|running| *running = running.saturating_sub(1));
        self.schedule_restart(root);
    }

    /// Roots without live coverage are crawled again after a settle delay.
    fn schedule_restart(self: &Arc<Self>, root: PathBuf) {
        if self.cancel.is_cancelled() {
            return;
        }
        {
            let mut state = self.state.lock();
            let polled = self.backend.is_none() || self.root_has_polled(&state.watches, &root);
            let Some(root_state) = state.roots.get_mut(&root) else {
                return;
            };
            if !polled || root_state.restart_pending || root_state.phase != RootPhase::Idle {
                return;
            }
            root_state.restart_pending = true;
        }

        let inner = Arc::clone(self);
        let settle = self.config.restart_settle();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(settle) => {}
            }
            let start = {
                let mut state = inner.state.lock();
                let Some(root_state) = state.roots.get_mut(&root) else {
                    return;
                };
                root_state.restart_pending = false;
                if root_state.phase != RootPhase::Idle {
                    false
                } else {
                    root_state
                        .queue
                        .push(ScanRequest::new(root.clone(), true, false), false);
                    root_state.phase = RootPhase::Restarting;
                    true
                }
            };
            if start {
                debug!(root = %root.display(), "restart pass");
                inner.start_drain(root);
            }
        });
    }

    /// Whether a directory of `root` itself is covered only by polling.
    /// Watched symlink targets count for the root of their link.
    fn root_has_polled(&self, watches: &WatchTable, root: &Path) -> bool {
        let roots = self.parser.roots();
        watches.polled().into_iter().any(|dir| {
            let dir = watches.resolve_alias(&dir).unwrap_or(dir);
            roots.root_of(&dir).as_deref() == Some(root)
        })
    }

    async fn process(self: &Arc<Self>, request: ScanRequest) {
        let dir = request.directory.clone();
        let subdirs = self
            .scan_one(&dir, request.force_thumbnail_check)
            .await;

        if request.recursive && !self.cancel.is_cancelled() {
            {
                let mut state = self.state.lock();
                for sub in &subdirs {
                    if state.pending.insert(sub.clone()) {
                        *state.outstanding.entry(dir.clone()).or_default() += 1;
                    }
                }
            }
            for sub in subdirs {
                self.enqueue(
                    ScanRequest::new(sub, true, request.force_thumbnail_check),
                    false,
                );
            }
        }

        self.settle(dir, true).await;
        if let Err(err) = self.parser.writer().commit().await {
            warn!(path = %request.directory.display(), error = %err, "commit failed");
        }
    }

    /// Scan one directory and return the subdirectories worth descending.
    async fn scan_one(self: &Arc<Self>, dir: &Path, force_thumbnail_check: bool) -> Vec<PathBuf> {
        if self.indexed_at_target(dir).await {
            debug!(path = %dir.display(), "symlink target is crawled in its own right; not descending");
            return Vec::new();
        }
        let listing = match self.listings.list(dir, self.parser.overlay_root()).await {
            Ok(listing) => listing,
            Err(err) => {
                debug!(path = %dir.display(), error = %err, "directory vanished before scan");
                return Vec::new();
            }
        };
        let Some(dir_row) = self.directory_row(dir).await else {
            debug!(path = %dir.display(), "directory has no store identity; skipped");
            return Vec::new();
        };
        if dir_row.id.kind == ItemKind::Disc {
            self.drop_watches(dir);
            return Vec::new();
        }

        self.install_watch(dir).await;
        self.reconcile(&dir_row, &listing).await;

        let parent = ParentRef::Stored(dir_row.id);
        let mut subdirs = Vec::new();
        for entry in listing.iter() {
            if self.cancel.is_cancelled() {
                break;
            }
            if entry.name.starts_with('.') {
                continue;
            }
            if !entry.is_dir && self.config.is_cover_name(&entry.name) {
                continue;
            }

            let mut item = Item::from_entry(entry, parent.clone());
            let load = self
                .parser
                .parse_with_listing(&mut item, force_thumbnail_check, Some(listing.as_slice()))
                .await;
            trace!(path = %entry.path.display(), ?load, "parsed");
            if !entry.is_dir {
                continue;
            }

            match item.kind() {
                Some(ItemKind::Directory) => {
                    if entry.is_symlink && self.indexed_at_target(&entry.path).await {
                        debug!(path = %entry.path.display(), "symlink target is crawled in its own right; not descending");
                        continue;
                    }
                    if self.has_marker(&entry.path).await {
                        debug!(path = %entry.path.display(), "no-crawl marker present");
                        continue;
                    }
                    subdirs.push(entry.path.clone());
                }
                Some(ItemKind::Disc) => self.drop_watches(&entry.path),
                Some(kind) => {
                    warn!(path = %entry.path.display(), kind = %kind, "directory classified as unexpected kind; not descending");
                }
                None => {
                    debug!(path = %entry.path.display(), "directory not persisted; not descending");
                }
            }
        }
        subdirs
    }

    /// Store row of `dir`, parsing it first when it has none.
    async fn directory_row(&self, dir: &Path) -> Option<StoredItem> {
        let store = self.parser.writer().store();
        match store.get_by_path(dir).await {
            Ok(Some(row)) => return Some(row),
            Ok(None) => {}
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "store lookup failed");
                return None;
            }
        }
        let parent = match dir.parent() {
            Some(above) if !self.parser.roots().contains(dir) => {
                ParentRef::Unresolved(above.to_path_buf())
            }
            _ => ParentRef::Root,
        };
        let mut item = Item::stat(dir, parent).await?;
        self.parser.parse(&mut item, false).await;
        store.get_by_path(dir).await.ok().flatten()
    }

    /// Delete stored children that no longer appear in the listing.
    async fn reconcile(self: &Arc<Self>, dir_row: &StoredItem, listing: &[ListingEntry]) {
        let store = self.parser.writer().store();
        let children = match store.children(dir_row.id).await {
            Ok(children) => children,
            Err(err) => {
                warn!(path = %dir_row.path.display(), error = %err, "listing stored children failed");
                return;
            }
        };
        let present: HashSet<&Path> = listing
            .iter()
            .filter(|entry| !entry.name.starts_with('.'))
            .filter(|entry| entry.is_dir || !self.config.is_cover_name(&entry.name))
            .map(|entry| entry.path.as_path())
            .collect();

        for child in children {
            if child.id.kind == ItemKind::Track || present.contains(child.path.as_path()) {
                continue;
            }
            debug!(path = %child.path.display(), "removing vanished item");
            if let Err(err) = self.parser.writer().delete(child.id).await {
                warn!(path = %child.path.display(), error = %err, "removing vanished item failed");
                continue;
            }
            if child.is_dir {
                for parent in self.forget_subtree(&child.path) {
                    self.settle(parent, true).await;
                }
            }
        }
    }

    async fn install_watch(&self, dir: &Path) {
        if self.state.lock().watches.contains(dir) {
            return;
        }
        let Some(backend) = &self.backend else {
            self.state.lock().watches.insert(dir.to_path_buf(), false);
            return;
        };

        let is_link = tokio::fs::symlink_metadata(dir)
            .await
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        let target = if is_link {
            match tokio::fs::canonicalize(dir).await {
                Ok(real) => real,
                Err(err) => {
                    debug!(path = %dir.display(), error = %err, "symlink target unresolvable");
                    return;
                }
            }
        } else {
            dir.to_path_buf()
        };

        if is_link && self.parser.roots().root_of(&target).is_some() {
            // The target carries its own watch as part of its root.
            return;
        }

        let live = match backend.watch(&target) {
            Ok(live) => live,
            Err(err) => {
                warn!(path = %target.display(), error = %err, "watch failed; falling back to periodic rescans");
                false
            }
        };
        let mut state = self.state.lock();
        state.watches.insert(target.clone(), live);
        if is_link {
            state.watches.insert(dir.to_path_buf(), false);
            state.watches.add_alias(target, dir.to_path_buf());
        }
    }

    /// A symlinked directory whose real path lies inside a registered root.
    /// Its contents are indexed, watched and rolled up at the real path.
    async fn indexed_at_target(&self, dir: &Path) -> bool {
        let roots = self.parser.roots();
        if roots.contains(dir) {
            return false;
        }
        let is_link = tokio::fs::symlink_metadata(dir)
            .await
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            return false;
        }
        match tokio::fs::canonicalize(dir).await {
            Ok(real) => roots.root_of(&real).is_some(),
            Err(_) => false,
        }
    }

    fn drop_watches(&self, path: &Path) {
        let removed = self.state.lock().watches.remove_subtree(path);
        if let Some(backend) = &self.backend {
            for (dir, live) in removed {
                if live {
                    backend.unwatch(&dir);
                }
            }
        }
    }

    /// Forget watches, queued scans and cached listings at or below `path`.
    fn forget_subtree(self: &Arc<Self>, path: &Path) -> Vec<PathBuf> {
        self.drop_watches(path);
        self.listings.invalidate_under(path);

        let mut settled = Vec::new();
        let mut state = self.state.lock();
        let dropped: usize = state
            .roots
            .values_mut()
            .map(|root| root.queue.remove_under(path))
            .sum();
        if dropped > 0 {
            debug!(path = %path.display(), dropped, "dropped queued scans");
        }

        let owed: Vec<PathBuf> = state
            .pending
            .iter()
            .filter(|pending| pending.starts_with(path))
            .cloned()
            .collect();
        state.outstanding.retain(|dir, _| !dir.starts_with(path));
        for pending in owed {
            state.pending.remove(&pending);
            let Some(parent) = pending.parent() else {
                continue;
            };
            if parent.starts_with(path) {
                continue;
            }
            if let Some(count) = state.outstanding.get_mut(parent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.outstanding.remove(parent);
                    settled.push(parent.to_path_buf());
                }
            }
        }
        settled
    }

    async fn has_marker(&self, dir: &Path) -> bool {
        if self.config.no_crawl_marker.is_empty() {
            return false;
        }
        tokio::fs::try_exists(dir.join(&self.config.no_crawl_marker))
            .await
            .unwrap_or(false)
    }

    /// Roll `dir` up and walk towards the root.
    ///
    /// `scanned` marks that `dir` just finished its own scan, which settles
    /// the parent's outstanding count. Otherwise the walk continues only
    /// while a level actually changed.
    async fn settle(&self, dir: PathBuf, scanned: bool) {
        let mut dir = dir;
        let mut scanned = scanned;
        loop {
            if self.state.lock().outstanding.contains_key(&dir) {
                return;
            }
            let changed = self.rollup(&dir).await;
            let reported = scanned && self.state.lock().pending.remove(&dir);
            let Some(parent) = dir.parent().map(Path::to_path_buf) else {
                return;
            };

            if reported {
                let parent_settled = {
                    let mut state = self.state.lock();
                    match state.outstanding.get_mut(&parent) {
                        Some(count) if *count > 1 => {
                            *count -= 1;
                            false
                        }
                        Some(_) => {
                            state.outstanding.remove(&parent);
                            true
                        }
                        None => true,
                    }
                };
                if !parent_settled {
                    return;
                }
                dir = parent;
                continue;
            }

            let roots = self.parser.roots();
            if !changed || roots.contains(&dir) || roots.root_of(&parent).is_none() {
                return;
            }
            dir = parent;
            scanned = false;
        }
    }

    /// Recompute a directory's rolled-up attributes. Returns whether the
    /// stored row changed.
    async fn rollup(&self, dir: &Path) -> bool {
        let store = self.parser.writer().store();
        let row = match store.get_by_path(dir).await {
            Ok(Some(row)) if row.id.kind == ItemKind::Directory => row,
            Ok(_) => return false,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "rollup lookup failed");
                return false;
            }
        };
        let children = match store.children(row.id).await {
            Ok(children) => children,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "rollup children lookup failed");
                return false;
            }
        };
        let attrs: Vec<_> = children.into_iter().map(|child| child.attrs).collect();
        let next = rollup::aggregate(&row.attrs, &attrs);
        if !rollup::changed(&row.attrs, &next) {
            return false;
        }
        match self.parser.writer().update(row.id, row.mtime, &next).await {
            Ok(()) => {
                trace!(path = %dir.display(), length = ?next.length, "rolled up");
                true
            }
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "rollup write failed");
                false
            }
        }
    }
}

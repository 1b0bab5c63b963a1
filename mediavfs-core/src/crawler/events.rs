//! Live change reconciliation.
//!
//! Events pass a growth debounce, then a FIFO gate that also waits out the
//! store's reader lock, so deferred events replay in arrival order. Each
//! handled event ends with a commit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::{CrawlerInner, ScanRequest};
use crate::item::is_hidden;
use crate::watch::{EventMask, WatchEvent};

impl CrawlerInner {
    pub(super) async fn notify(self: Arc<Self>, event: WatchEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let event = self.resolve_aliases(event);
        let mask = event.mask;

        if mask.contains(EventMask::MODIFY)
            && !mask.intersects(
                EventMask::CREATE
                    | EventMask::CLOSE_WRITE
                    | EventMask::DELETE
                    | EventMask::DELETE_SELF
                    | EventMask::MOVE
                    | EventMask::OVERFLOW,
            )
        {
            self.defer_growth(event.path);
            return;
        }
        if mask.contains(EventMask::CLOSE_WRITE) && self.growth.lock().remove(&event.path).is_some()
        {
            trace!(path = %event.path.display(), "write closed; growth wait ended");
        }

        self.handle(event).await;
    }

    fn resolve_aliases(&self, mut event: WatchEvent) -> WatchEvent {
        let state = self.state.lock();
        if let Some(link) = state.watches.resolve_alias(&event.path) {
            event.path = link;
        }
        if let Some(target) = &event.move_target
            && let Some(link) = state.watches.resolve_alias(target)
        {
            event.move_target = Some(link);
        }
        event
    }

    /// Hold a MODIFY until the path has been quiet for one debounce window.
    fn defer_growth(self: &Arc<Self>, path: PathBuf) {
        let deadline = tokio::time::Instant::now() + self.config.growth_debounce();
        {
            let mut growth = self.growth.lock();
            if let Some(existing) = growth.get_mut(&path) {
                *existing = deadline;
                return;
            }
            growth.insert(path.clone(), deadline);
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let mut growth = inner.growth.lock();
                    match growth.get(&path).copied() {
                        // Ended early by CLOSE_WRITE or stop().
                        None => return,
                        Some(deadline) if deadline <= tokio::time::Instant::now() => {
                            growth.remove(&path);
                            break;
                        }
                        Some(deadline) => deadline,
                    }
                };
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            trace!(path = %path.display(), "growth settled");
            inner.handle(WatchEvent::new(EventMask::MODIFY, path)).await;
        });
    }

    async fn handle(self: &Arc<Self>, event: WatchEvent) {
        let _gate = self.event_gate.lock().await;
        let lock = self.parser.writer().store().read_lock();
        if lock.is_locked() {
            debug!(path = %event.path.display(), "store reader-locked; event deferred");
            lock.await_unlock().await;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        trace!(?event, "handling live event");
        self.apply(event).await;

        if let Err(err) = self.parser.writer().commit().await {
            warn!(error = %err, "commit after live event failed");
        }
    }

    async fn apply(self: &Arc<Self>, event: WatchEvent) {
        let mask = event.mask;
        let path = event.path;

        if mask.contains(EventMask::OVERFLOW) {
            debug!(path = %path.display(), "events lost; rescanning");
            self.rescan(&path, true).await;
            return;
        }
        if mask.contains(EventMask::MOVE) {
            match event.move_target {
                Some(target) => self.apply_move(&path, &target).await,
                None => self.apply_delete(&path, false).await,
            }
            return;
        }
        if is_hidden(&path) {
            trace!(path = %path.display(), "hidden path ignored");
            return;
        }
        if mask.intersects(EventMask::DELETE | EventMask::DELETE_SELF | EventMask::UNMOUNT) {
            self.apply_delete(&path, mask.contains(EventMask::UNMOUNT))
                .await;
            return;
        }
        if mask.intersects(EventMask::CREATE | EventMask::MODIFY | EventMask::CLOSE_WRITE) {
            self.rescan(&path, false).await;
        }
    }

    /// Rescan around a created or changed path: the path itself recursively
    /// when it is a directory, then its containing directory.
    async fn rescan(self: &Arc<Self>, path: &Path, overflow: bool) {
        let roots = self.parser.roots().clone();
        if roots.root_of(path).is_none() {
            trace!(path = %path.display(), "event outside every root ignored");
            return;
        }
        if let Some(parent) = path.parent() {
            self.listings.invalidate(parent);
        }
        self.listings.invalidate(path);

        let is_dir = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.is_dir(),
            Err(_) => {
                // Gone again before we looked.
                self.apply_delete(path, false).await;
                return;
            }
        };

        if is_dir {
            if self.has_marker(path).await && !roots.contains(path) {
                debug!(path = %path.display(), "no-crawl marker present");
            } else {
                self.enqueue(ScanRequest::new(path, true, false), true);
            }
        }
        if roots.contains(path) {
            return;
        }
        if let Some(parent) = path.parent()
            && (!is_dir || !overflow)
        {
            self.enqueue(ScanRequest::new(parent, false, false), true);
        }
    }

    async fn apply_move(self: &Arc<Self>, from: &Path, to: &Path) {
        let roots = self.parser.roots().clone();
        match (is_hidden(from), is_hidden(to)) {
            (true, true) => return,
            (false, true) => return self.apply_delete(from, false).await,
            (true, false) => return self.rescan(to, false).await,
            (false, false) => {}
        }
        if roots.root_of(to).is_none() {
            return self.apply_delete(from, false).await;
        }

        let writer = self.parser.writer();
        let store = writer.store();
        let source = match store.get_by_path(from).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                debug!(from = %from.display(), to = %to.display(), "move of unknown source; treating as create");
                return self.rescan(to, false).await;
            }
            Err(err) => {
                warn!(path = %from.display(), error = %err, "store lookup failed");
                return;
            }
        };

        if let Ok(Some(existing)) = store.get_by_path(to).await
            && existing.id != source.id
        {
            debug!(path = %to.display(), "move replaces existing item");
            if let Err(err) = writer.delete(existing.id).await {
                warn!(path = %to.display(), error = %err, "removing move destination failed");
            }
            for parent in self.forget_subtree(to) {
                self.settle(parent, true).await;
            }
        }

        let new_parent = match to.parent() {
            Some(parent) => store.get_by_path(parent).await.ok().flatten(),
            None => None,
        };
        let relocated = match &new_parent {
            Some(parent) => match writer.relocate(source.id, Some(parent.id), to).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(from = %from.display(), to = %to.display(), error = %err, "relocate failed");
                    false
                }
            },
            None => false,
        };
        if !relocated {
            // Destination directory unknown to the store; index it fresh.
            self.apply_delete(from, false).await;
            return self.rescan(to, false).await;
        }
        debug!(from = %from.display(), to = %to.display(), "item moved");

        if let Some(parent) = from.parent() {
            self.listings.invalidate(parent);
        }
        if source.is_dir {
            for parent in self.forget_subtree(from) {
                self.settle(parent, true).await;
            }
            self.enqueue(ScanRequest::new(to, true, false), true);
        }
        for dir in [from.parent(), to.parent()].into_iter().flatten() {
            if roots.root_of(dir).is_some() {
                self.listings.invalidate(dir);
                self.enqueue(ScanRequest::new(dir, false, false), true);
            }
        }
    }

    async fn apply_delete(self: &Arc<Self>, path: &Path, unmount: bool) {
        if unmount {
            info!(path = %path.display(), "volume unmounted; removing its items");
        }
        let writer = self.parser.writer();
        match writer.store().get_by_path(path).await {
            Ok(Some(row)) => match writer.delete(row.id).await {
                Ok(removed) => debug!(path = %path.display(), removed, "items removed"),
                Err(err) => warn!(path = %path.display(), error = %err, "removing items failed"),
            },
            Ok(None) => trace!(path = %path.display(), "delete of unknown path"),
            Err(err) => warn!(path = %path.display(), error = %err, "store lookup failed"),
        }

        let settled = self.forget_subtree(path);
        for parent in settled {
            self.settle(parent, true).await;
        }
        if let Some(parent) = path.parent()
            && self.parser.roots().root_of(parent).is_some()
        {
            self.listings.invalidate(parent);
            self.settle(parent.to_path_buf(), false).await;
        }
    }
}

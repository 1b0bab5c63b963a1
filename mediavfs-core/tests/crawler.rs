use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use mediavfs_core::IndexError;
use mediavfs_core::config::CrawlerConfig;
use mediavfs_core::crawler::{Crawler, RootPhase};
use mediavfs_core::item::{AttributeBag, ItemKind, extension_of};
use mediavfs_core::parser::{ExtensionExtractor, Extractor, NullThumbnailer, Parser};
use mediavfs_core::scheduler::{Policy, Scheduler};
use mediavfs_core::store::{MemoryStore, Store, StoreWriter};
use mediavfs_core::watch::{EventMask, WatchBackend, WatchEvent};
use parking_lot::Mutex;
use tempfile::TempDir;
use uuid::Uuid;

/// Extension classification plus a fixed playback length per media type.
#[derive(Debug, Default)]
struct LengthExtractor {
    base: ExtensionExtractor,
}

#[async_trait]
impl Extractor for LengthExtractor {
    async fn extract(&self, path: &Path, is_dir: bool) -> AttributeBag {
        let mut bag = self.base.extract(path, is_dir).await;
        bag.length = match extension_of(path).as_deref() {
            Some("mp3") => Some(100.0),
            Some("mkv") => Some(50.0),
            _ => None,
        };
        bag
    }
}

#[derive(Debug)]
struct RecordingBackend {
    live: bool,
    watched: Mutex<Vec<PathBuf>>,
    unwatched: Mutex<Vec<PathBuf>>,
}

impl RecordingBackend {
    fn new(live: bool) -> Arc<Self> {
        Arc::new(Self {
            live,
            watched: Mutex::new(Vec::new()),
            unwatched: Mutex::new(Vec::new()),
        })
    }
}

impl WatchBackend for RecordingBackend {
    fn watch(&self, dir: &Path) -> mediavfs_core::Result<bool> {
        self.watched.lock().push(dir.to_path_buf());
        Ok(self.live)
    }

    fn unwatch(&self, dir: &Path) {
        self.unwatched.lock().push(dir.to_path_buf());
    }
}

/// Live everywhere except below `polled`.
#[derive(Debug)]
struct SelectiveBackend {
    polled: PathBuf,
}

impl WatchBackend for SelectiveBackend {
    fn watch(&self, dir: &Path) -> mediavfs_core::Result<bool> {
        Ok(!dir.starts_with(&self.polled))
    }

    fn unwatch(&self, _dir: &Path) {}
}

struct Harness {
    dir: TempDir,
    store: Arc<MemoryStore>,
    crawler: Crawler,
}

impl Harness {
    fn new(backend: Option<Arc<dyn WatchBackend>>) -> Self {
        Self::with_config(
            backend,
            CrawlerConfig {
                growth_debounce_ms: 200,
                listing_cache_ms: 0,
                ..CrawlerConfig::default()
            },
        )
    }

    fn with_config(backend: Option<Arc<dyn WatchBackend>>, config: CrawlerConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let parser = Parser::new(
            StoreWriter::new(store.clone()),
            Arc::new(LengthExtractor::default()),
            Arc::new(NullThumbnailer),
        );
        let crawler = Crawler::new(
            parser,
            Scheduler::unavailable(),
            backend,
            config,
            Policy::Greedy,
        );
        Self {
            dir,
            store,
            crawler,
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    fn write(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, b"data").unwrap();
        path
    }

    /// `song.mp3` and `sub/{clip.mkv, cover.jpg}`, crawled.
    async fn crawled_tree(backend: Option<Arc<dyn WatchBackend>>) -> Self {
        let harness = Self::new(backend);
        harness.write("song.mp3");
        harness.write("sub/clip.mkv");
        harness.write("sub/cover.jpg");
        harness.crawler.append(harness.root()).await.unwrap();
        harness.crawler.wait_idle().await;
        harness
    }

    async fn notify(&self, mask: EventMask, name: &str) {
        self.crawler
            .notify(WatchEvent::new(mask, self.path(name)))
            .await;
        self.crawler.wait_idle().await;
    }

    fn rows_at(&self, path: &Path) -> usize {
        self.store
            .rows()
            .iter()
            .filter(|row| row.path == path)
            .count()
    }
}

fn set_mtime(path: &Path, secs: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

#[tokio::test]
async fn crawl_builds_the_tree_and_rolls_up() {
    let harness = Harness::crawled_tree(None).await;

    let rows = harness.store.rows();
    let dirs = rows.iter().filter(|r| r.id.kind == ItemKind::Directory).count();
    let leaves = rows.iter().filter(|r| !r.is_dir).count();
    assert_eq!(dirs, 2);
    assert_eq!(leaves, 2);
    assert!(harness.store.row(&harness.path("sub/cover.jpg")).is_none());

    let root = harness.store.row(harness.root()).unwrap();
    assert_eq!(root.attrs.length, Some(150.0));

    let sub = harness.store.row(&harness.path("sub")).unwrap();
    assert_eq!(sub.attrs.length, Some(50.0));
    assert_eq!(sub.attrs.image, Some(harness.path("sub/cover.jpg")));
    assert!(sub.attrs.image_authored);
    assert_eq!(sub.parent, Some(root.id));

    assert_eq!(harness.crawler.queued(), 0);
    assert!(harness.store.commit_count() > 0);
    harness.crawler.stop();
}

#[tokio::test]
async fn appending_a_root_twice_indexes_it_once() {
    let harness = Harness::new(None);
    harness.write("a.mp3");
    harness.write("b/c.mp3");

    harness.crawler.append(harness.root()).await.unwrap();
    harness.crawler.append(harness.root()).await.unwrap();
    harness.crawler.wait_idle().await;

    assert_eq!(harness.crawler.roots(), [harness.root().to_path_buf()]);
    assert_eq!(harness.store.rows().len(), 4);
    for name in ["a.mp3", "b", "b/c.mp3"] {
        assert_eq!(harness.rows_at(&harness.path(name)), 1, "{name}");
    }
    harness.crawler.stop();
}

#[tokio::test]
async fn unreadable_roots_are_rejected() {
    let harness = Harness::new(None);
    let missing = harness.path("missing");
    let err = harness.crawler.append(&missing).await.unwrap_err();
    assert!(matches!(err, IndexError::RootUnreadable { path, .. } if path == missing));

    let file = harness.write("plain.mp3");
    assert!(matches!(
        harness.crawler.append(&file).await,
        Err(IndexError::RootUnreadable { .. })
    ));
    assert!(harness.crawler.roots().is_empty());
}

#[tokio::test]
async fn delete_then_create_leaves_exactly_one_row() {
    let harness = Harness::crawled_tree(None).await;
    let song = harness.path("song.mp3");

    std::fs::remove_file(&song).unwrap();
    harness.notify(EventMask::DELETE, "song.mp3").await;
    assert_eq!(harness.rows_at(&song), 0);
    let root = harness.store.row(harness.root()).unwrap();
    assert_eq!(root.attrs.length, Some(50.0));

    harness.write("song.mp3");
    set_mtime(&song, 4_000);
    harness.notify(EventMask::CREATE, "song.mp3").await;

    assert_eq!(harness.rows_at(&song), 1);
    let row = harness.store.row(&song).unwrap();
    assert_eq!(row.mtime, Some(4_000_000));
    let root = harness.store.row(harness.root()).unwrap();
    assert_eq!(root.attrs.length, Some(150.0));
    harness.crawler.stop();
}

#[tokio::test]
async fn deleting_a_leaf_rolls_the_change_up() {
    let harness = Harness::crawled_tree(None).await;

    std::fs::remove_file(harness.path("sub/clip.mkv")).unwrap();
    harness.notify(EventMask::DELETE, "sub/clip.mkv").await;

    let sub = harness.store.row(&harness.path("sub")).unwrap();
    assert_eq!(sub.attrs.length, None);
    let root = harness.store.row(harness.root()).unwrap();
    assert_eq!(root.attrs.length, Some(100.0));
    harness.crawler.stop();
}

#[tokio::test]
async fn move_onto_an_existing_destination_replaces_it() {
    let harness = Harness::new(None);
    let a = harness.write("a.mp3");
    let b = harness.write("b.mp3");
    harness.crawler.append(harness.root()).await.unwrap();
    harness.crawler.wait_idle().await;
    let moved = harness.store.row(&a).unwrap();
    let replaced = harness.store.row(&b).unwrap();

    std::fs::rename(&a, &b).unwrap();
    harness
        .crawler
        .notify(WatchEvent::moved(&a, &b))
        .await;
    harness.crawler.wait_idle().await;

    assert_eq!(harness.rows_at(&a), 0);
    assert_eq!(harness.rows_at(&b), 1);
    let row = harness.store.row(&b).unwrap();
    assert_eq!(row.id, moved.id);
    assert_ne!(row.id, replaced.id);
    assert_eq!(harness.store.rows().len(), 2);
    harness.crawler.stop();
}

#[tokio::test]
async fn moving_a_directory_relocates_its_subtree() {
    let harness = Harness::crawled_tree(None).await;
    let before = harness.store.row(&harness.path("sub/clip.mkv")).unwrap();

    std::fs::rename(harness.path("sub"), harness.path("renamed")).unwrap();
    harness
        .crawler
        .notify(WatchEvent::moved(harness.path("sub"), harness.path("renamed")).with_dir())
        .await;
    harness.crawler.wait_idle().await;

    assert!(harness.store.row(&harness.path("sub")).is_none());
    let clip = harness.store.row(&harness.path("renamed/clip.mkv")).unwrap();
    assert_eq!(clip.id, before.id);
    assert_eq!(harness.store.rows().len(), 4);
    harness.crawler.stop();
}

#[tokio::test]
async fn hidden_names_follow_move_rules() {
    let harness = Harness::crawled_tree(None).await;

    harness.write(".partial.mp3");
    harness.notify(EventMask::CREATE, ".partial.mp3").await;
    assert!(harness.store.row(&harness.path(".partial.mp3")).is_none());

    std::fs::rename(harness.path(".partial.mp3"), harness.path("done.mp3")).unwrap();
    harness
        .crawler
        .notify(WatchEvent::moved(
            harness.path(".partial.mp3"),
            harness.path("done.mp3"),
        ))
        .await;
    harness.crawler.wait_idle().await;
    assert!(harness.store.row(&harness.path("done.mp3")).is_some());

    std::fs::rename(harness.path("song.mp3"), harness.path(".trash.mp3")).unwrap();
    harness
        .crawler
        .notify(WatchEvent::moved(
            harness.path("song.mp3"),
            harness.path(".trash.mp3"),
        ))
        .await;
    harness.crawler.wait_idle().await;
    assert!(harness.store.row(&harness.path("song.mp3")).is_none());
    assert!(harness.store.row(&harness.path(".trash.mp3")).is_none());
    harness.crawler.stop();
}

#[tokio::test]
async fn growing_files_are_written_once_per_quiet_window() {
    let harness = Harness::crawled_tree(None).await;
    let song = harness.path("song.mp3");
    let before = harness.store.revision(&song).unwrap();

    for step in 0..5u64 {
        let mut file = File::options().append(true).open(&song).unwrap();
        file.write_all(b"more").unwrap();
        drop(file);
        set_mtime(&song, 10_000 + step);
        harness.crawler.notify(WatchEvent::new(EventMask::MODIFY, &song)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    assert_eq!(harness.store.revision(&song), Some(before));

    tokio::time::sleep(Duration::from_millis(600)).await;
    harness.crawler.wait_idle().await;
    assert_eq!(harness.store.revision(&song), Some(before + 1));
    assert_eq!(harness.store.row(&song).unwrap().mtime, Some(10_004_000));
    harness.crawler.stop();
}

#[tokio::test]
async fn close_write_ends_the_growth_wait() {
    let harness = Harness::crawled_tree(None).await;
    let song = harness.path("song.mp3");
    let before = harness.store.revision(&song).unwrap();

    set_mtime(&song, 20_000);
    harness.crawler.notify(WatchEvent::new(EventMask::MODIFY, &song)).await;
    harness.notify(EventMask::CLOSE_WRITE, "song.mp3").await;
    assert_eq!(harness.store.revision(&song), Some(before + 1));

    // The cancelled growth timer must not fire a second write.
    tokio::time::sleep(Duration::from_millis(400)).await;
    harness.crawler.wait_idle().await;
    assert_eq!(harness.store.revision(&song), Some(before + 1));
    harness.crawler.stop();
}

#[tokio::test]
async fn events_wait_for_the_reader_lock() {
    let harness = Harness::crawled_tree(None).await;
    let song = harness.path("song.mp3");
    std::fs::remove_file(&song).unwrap();

    let reader = Uuid::new_v4();
    harness.store.read_lock().lock(reader);
    let crawler = harness.crawler.clone();
    let event = WatchEvent::new(EventMask::DELETE, &song);
    let pending = tokio::spawn(async move { crawler.notify(event).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.store.row(&song).is_some());

    harness.store.read_lock().unlock(reader);
    pending.await.unwrap();
    assert!(harness.store.row(&song).is_none());
    harness.crawler.stop();
}

#[tokio::test]
async fn deferred_events_replay_in_arrival_order() {
    let harness = Harness::crawled_tree(None).await;
    let song = harness.path("song.mp3");
    std::fs::remove_file(&song).unwrap();

    let reader = Uuid::new_v4();
    harness.store.read_lock().lock(reader);
    let deleted = {
        let crawler = harness.crawler.clone();
        let event = WatchEvent::new(EventMask::DELETE, &song);
        tokio::spawn(async move { crawler.notify(event).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.write("song.mp3");
    set_mtime(&song, 6_000);
    let created = {
        let crawler = harness.crawler.clone();
        let event = WatchEvent::new(EventMask::CREATE, &song);
        tokio::spawn(async move { crawler.notify(event).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_ne!(harness.store.row(&song).unwrap().mtime, Some(6_000_000));

    harness.store.read_lock().unlock(reader);
    deleted.await.unwrap();
    created.await.unwrap();
    harness.crawler.wait_idle().await;

    assert_eq!(harness.rows_at(&song), 1);
    assert_eq!(harness.store.row(&song).unwrap().mtime, Some(6_000_000));
    harness.crawler.stop();
}

#[tokio::test]
async fn overflow_rescans_and_reconciles_removals() {
    let harness = Harness::crawled_tree(None).await;
    std::fs::remove_file(harness.path("sub/clip.mkv")).unwrap();
    harness.write("sub/new.mp3");

    harness
        .crawler
        .notify(WatchEvent::new(EventMask::OVERFLOW, harness.root()))
        .await;
    harness.crawler.wait_idle().await;

    assert!(harness.store.row(&harness.path("sub/clip.mkv")).is_none());
    assert!(harness.store.row(&harness.path("sub/new.mp3")).is_some());
    let root = harness.store.row(harness.root()).unwrap();
    assert_eq!(root.attrs.length, Some(200.0));
    harness.crawler.stop();
}

#[tokio::test]
async fn no_crawl_marker_stops_descent() {
    let harness = Harness::new(None);
    harness.write("private/.nomedia");
    harness.write("private/secret.mp3");
    harness.write("open/song.mp3");
    harness.crawler.append(harness.root()).await.unwrap();
    harness.crawler.wait_idle().await;

    assert!(harness.store.row(&harness.path("private")).is_some());
    assert!(harness.store.row(&harness.path("private/secret.mp3")).is_none());
    assert!(harness.store.row(&harness.path("open/song.mp3")).is_some());
    harness.crawler.stop();
}

#[tokio::test]
async fn watches_follow_the_tree() {
    let backend = RecordingBackend::new(true);
    let harness = Harness::crawled_tree(Some(backend.clone())).await;

    let mut watched = backend.watched.lock().clone();
    watched.sort();
    assert_eq!(watched, [harness.root().to_path_buf(), harness.path("sub")]);
    assert!(!harness.crawler.watches().has_polled());

    std::fs::remove_dir_all(harness.path("sub")).unwrap();
    harness
        .notify(EventMask::DELETE_SELF | EventMask::ISDIR, "sub")
        .await;
    assert_eq!(*backend.unwatched.lock(), [harness.path("sub")]);
    assert!(harness.store.row(&harness.path("sub/clip.mkv")).is_none());

    harness.crawler.stop();
    assert_eq!(
        *backend.unwatched.lock(),
        [harness.path("sub"), harness.root().to_path_buf()]
    );
}

#[tokio::test]
async fn unsupported_watches_fall_back_to_polling() {
    let backend = RecordingBackend::new(false);
    let harness = Harness::crawled_tree(Some(backend)).await;
    let table = harness.crawler.watches();
    assert!(table.has_polled());
    assert_eq!(table.get(harness.root()), Some(false));
    harness.crawler.stop();
}

#[tokio::test]
async fn polling_roots_pick_up_changes_on_restart() {
    let harness = Harness::with_config(
        None,
        CrawlerConfig {
            listing_cache_ms: 0,
            restart_settle_ms: 100,
            restart_multiplier: 5.0,
            ..CrawlerConfig::default()
        },
    );
    harness.write("a.mp3");
    harness.crawler.append(harness.root()).await.unwrap();
    harness.crawler.wait_idle().await;
    assert_ne!(harness.crawler.phase(harness.root()), Some(RootPhase::Restarting));

    let late = harness.write("b.mp3");
    assert!(harness.store.row(&late).is_none());

    // No event is sent; only the restart pass can find it.
    tokio::time::sleep(Duration::from_millis(400)).await;
    harness.crawler.wait_idle().await;
    assert!(harness.store.row(&late).is_some());
    let root = harness.store.row(harness.root()).unwrap();
    assert_eq!(root.attrs.length, Some(200.0));
    harness.crawler.stop();
}

#[tokio::test]
async fn live_roots_are_not_restarted_for_polled_neighbours() {
    let other = TempDir::new().unwrap();
    let backend = Arc::new(SelectiveBackend {
        polled: other.path().to_path_buf(),
    });
    let harness = Harness::with_config(
        Some(backend),
        CrawlerConfig {
            listing_cache_ms: 0,
            restart_settle_ms: 100,
            ..CrawlerConfig::default()
        },
    );
    harness.write("a.mp3");
    std::fs::write(other.path().join("x.mp3"), b"data").unwrap();
    harness.crawler.append(harness.root()).await.unwrap();
    harness.crawler.append(other.path()).await.unwrap();
    harness.crawler.wait_idle().await;
    assert!(harness.crawler.watches().has_polled());

    let late = harness.write("b.mp3");
    std::fs::write(other.path().join("y.mp3"), b"data").unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    harness.crawler.wait_idle().await;

    assert!(harness.store.row(&late).is_none());
    assert!(harness.store.row(&other.path().join("y.mp3")).is_some());
    harness.crawler.stop();
}

#[tokio::test]
async fn symlinks_into_a_root_stay_at_their_real_path() {
    let backend = RecordingBackend::new(true);
    let harness = Harness::new(Some(backend.clone()));
    harness.write("b/song.mp3");
    std::fs::create_dir_all(harness.path("a")).unwrap();
    std::os::unix::fs::symlink(harness.path("b"), harness.path("a/link")).unwrap();
    harness.crawler.append(harness.root()).await.unwrap();
    harness.crawler.wait_idle().await;

    assert!(harness.store.row(&harness.path("a/link/song.mp3")).is_none());
    assert!(harness.crawler.watches().resolve_alias(&harness.path("b")).is_none());

    harness.write("b/new.mp3");
    harness.notify(EventMask::CREATE, "b/new.mp3").await;
    assert!(harness.store.row(&harness.path("b/new.mp3")).is_some());
    assert!(harness.store.row(&harness.path("a/link/new.mp3")).is_none());

    std::fs::remove_file(harness.path("a/link")).unwrap();
    harness.notify(EventMask::DELETE, "a/link").await;
    assert!(!backend.unwatched.lock().contains(&harness.path("b")));
    assert_eq!(harness.crawler.watches().get(&harness.path("b")), Some(true));
    assert!(harness.store.row(&harness.path("b/song.mp3")).is_some());
    harness.crawler.stop();
}

#[tokio::test]
async fn symlinks_out_of_every_root_are_watched_at_the_target() {
    let outside = TempDir::new().unwrap();
    let real = outside.path().canonicalize().unwrap();
    std::fs::write(real.join("song.mp3"), b"data").unwrap();

    let backend = RecordingBackend::new(true);
    let harness = Harness::new(Some(backend.clone()));
    std::os::unix::fs::symlink(&real, harness.path("link")).unwrap();
    harness.crawler.append(harness.root()).await.unwrap();
    harness.crawler.wait_idle().await;

    assert!(harness.store.row(&harness.path("link/song.mp3")).is_some());
    assert!(backend.watched.lock().contains(&real));
    assert!(!harness.crawler.watches().has_polled());

    std::fs::write(real.join("new.mp3"), b"data").unwrap();
    harness
        .crawler
        .notify(WatchEvent::new(EventMask::CREATE, real.join("new.mp3")))
        .await;
    harness.crawler.wait_idle().await;
    assert!(harness.store.row(&harness.path("link/new.mp3")).is_some());

    std::fs::remove_file(harness.path("link")).unwrap();
    harness.notify(EventMask::DELETE, "link").await;
    assert!(backend.unwatched.lock().contains(&real));
    assert!(harness.store.row(&harness.path("link/song.mp3")).is_none());
    harness.crawler.stop();
}

#[tokio::test]
async fn stop_is_idempotent_and_final() {
    let harness = Harness::crawled_tree(None).await;
    harness.crawler.stop();
    harness.crawler.stop();
    assert!(harness.crawler.is_stopped());
    assert_eq!(harness.crawler.queued(), 0);
    assert!(harness.crawler.watches().is_empty());

    harness.crawler.wait_idle().await;
    assert!(matches!(
        harness.crawler.append(harness.root()).await,
        Err(IndexError::Stopped)
    ));

    let rows = harness.store.rows().len();
    harness.write("late.mp3");
    harness.notify(EventMask::CREATE, "late.mp3").await;
    assert_eq!(harness.store.rows().len(), rows);
}

#[tokio::test]
async fn commits_are_broadcast() {
    let harness = Harness::new(None);
    harness.write("a.mp3");
    let mut commits = harness.store.subscribe();
    harness.crawler.append(harness.root()).await.unwrap();
    harness.crawler.wait_idle().await;

    let notice = commits.recv().await.unwrap();
    assert!(notice.changes > 0);
    harness.crawler.stop();
}

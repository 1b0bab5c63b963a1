use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::debug;

/// One entry of a merged directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListingEntry {
    pub path: PathBuf,
    pub name: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Entry lives in the overlay directory rather than the media directory.
    pub is_overlay: bool,
    pub len: u64,
    pub mtime_ms: Option<i64>,
}

/// Milliseconds since the epoch of the file's last modification.
pub fn mtime_ms(meta: &Metadata) -> Option<i64> {
    let modified = meta.modified().ok()?;
    let since = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since.as_millis()).ok()
}

/// Shadow directory for `dir` under `overlay_root`.
pub fn overlay_dir(overlay_root: &Path, dir: &Path) -> PathBuf {
    let mut out = overlay_root.to_path_buf();
    for component in dir.components() {
        if let Component::Normal(seg) = component {
            out.push(seg);
        }
    }
    out
}

/// List `dir` merged with its overlay directory, sorted by name.
///
/// Entries that fail to stat are dropped. Overlay entries are only added
/// when the media directory has no entry of the same name.
pub async fn read_listing(
    dir: &Path,
    overlay_root: Option<&Path>,
) -> std::io::Result<Vec<ListingEntry>> {
    let mut entries = read_one(dir, false).await?;

    if let Some(root) = overlay_root {
        let shadow = overlay_dir(root, dir);
        if shadow != dir {
            match read_one(&shadow, true).await {
                Ok(extra) => {
                    let names: HashSet<String> =
                        entries.iter().map(|entry| entry.name.clone()).collect();
                    entries.extend(
                        extra
                            .into_iter()
                            .filter(|entry| !names.contains(&entry.name)),
                    );
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    debug!(path = %shadow.display(), error = %err, "overlay directory unreadable");
                }
            }
        }
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

async fn read_one(dir: &Path, is_overlay: bool) -> std::io::Result<Vec<ListingEntry>> {
    let mut rd = tokio::fs::read_dir(dir).await?;
    let mut out = Vec::new();
    loop {
        let entry = match rd.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                debug!(path = %dir.display(), error = %err, "directory iteration stopped early");
                break;
            }
        };
        let path = entry.path();
        let link = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "dropping entry that failed to stat");
                continue;
            }
        };
        // Follow symlinks; a dangling link is dropped like any failed stat.
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "dropping entry that failed to stat");
                continue;
            }
        };
        out.push(ListingEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
            is_dir: meta.is_dir(),
            is_symlink: link.file_type().is_symlink(),
            is_overlay,
            len: meta.len(),
            mtime_ms: mtime_ms(&meta),
        });
    }
    Ok(out)
}

/// Short-lived cache of merged listings keyed by directory path.
pub struct ListingCache {
    ttl: Duration,
    entries: Mutex<HashMap<PathBuf, (Instant, Arc<Vec<ListingEntry>>)>>,
}

impl fmt::Debug for ListingCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListingCache")
            .field("ttl", &self.ttl)
            .field("cached_dirs", &self.entries.lock().len())
            .finish()
    }
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, dir: &Path) -> Option<Arc<Vec<ListingEntry>>> {
        let mut entries = self.entries.lock();
        match entries.get(dir) {
            Some((taken, listing)) if taken.elapsed() < self.ttl => Some(Arc::clone(listing)),
            Some(_) => {
                entries.remove(dir);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, dir: PathBuf, listing: Arc<Vec<ListingEntry>>) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.lock().insert(dir, (Instant::now(), listing));
    }

    /// Drop the cached listing of `dir`.
    pub fn invalidate(&self, dir: &Path) {
        self.entries.lock().remove(dir);
    }

    /// Drop every cached listing at or below `dir`.
    pub fn invalidate_under(&self, dir: &Path) {
        self.entries.lock().retain(|path, _| !path.starts_with(dir));
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Cached listing, or a fresh read that is then cached.
    pub async fn list(
        &self,
        dir: &Path,
        overlay_root: Option<&Path>,
    ) -> std::io::Result<Arc<Vec<ListingEntry>>> {
        if let Some(hit) = self.get(dir) {
            return Ok(hit);
        }
        let listing = Arc::new(read_listing(dir, overlay_root).await?);
        self.insert(dir.to_path_buf(), Arc::clone(&listing));
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn listing_merges_overlay_and_sorts() {
        let media = tempdir().unwrap();
        let overlay = tempdir().unwrap();
        std::fs::write(media.path().join("b.mp3"), b"b").unwrap();
        std::fs::write(media.path().join("a.mp3"), b"a").unwrap();
        std::fs::create_dir(media.path().join("sub")).unwrap();

        let shadow = overlay_dir(overlay.path(), media.path());
        std::fs::create_dir_all(&shadow).unwrap();
        std::fs::write(shadow.join("a.mp3"), b"shadowed").unwrap();
        std::fs::write(shadow.join("a.srt"), b"subs").unwrap();

        let listing = read_listing(media.path(), Some(overlay.path()))
            .await
            .unwrap();
        let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.mp3", "a.srt", "b.mp3", "sub"]);

        let srt = &listing[1];
        assert!(srt.is_overlay);
        assert!(!listing[0].is_overlay);
        assert!(listing[3].is_dir);
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let tmp = tempdir().unwrap();
        assert!(read_listing(&tmp.path().join("gone"), None).await.is_err());
    }

    #[tokio::test]
    async fn cache_serves_until_invalidated() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("one.mp3"), b"1").unwrap();
        let cache = ListingCache::new(Duration::from_secs(60));

        let first = cache.list(tmp.path(), None).await.unwrap();
        std::fs::write(tmp.path().join("two.mp3"), b"2").unwrap();
        let cached = cache.list(tmp.path(), None).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(cached.len(), 1);

        cache.invalidate(tmp.path());
        let fresh = cache.list(tmp.path(), None).await.unwrap();
        assert_eq!(fresh.len(), 2);
    }
}

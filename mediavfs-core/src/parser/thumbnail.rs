use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::listing::mtime_ms;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbSize {
    Small,
    Large,
}

impl ThumbSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbSize::Small => "small",
            ThumbSize::Large => "large",
        }
    }

    /// Longest edge in pixels.
    pub fn edge(&self) -> u32 {
        match self {
            ThumbSize::Small => 160,
            ThumbSize::Large => 512,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThumbPriority {
    Low,
    High,
}

/// Work item handed to the thumbnail generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThumbnailRequest {
    pub source: PathBuf,
    pub size: ThumbSize,
    pub priority: ThumbPriority,
    /// Source is a video; grab a still frame instead of decoding an image.
    pub still_frame: bool,
    /// Generated thumbnail must be at least this recent (ms since epoch).
    pub check_mtime: Option<i64>,
}

/// Thumbnail cache collaborator. Encoding happens elsewhere; the parser only
/// asks whether a thumbnail is fresh and requests new ones.
pub trait Thumbnailer: Send + Sync + fmt::Debug {
    fn is_fresh(&self, image: &Path, size: ThumbSize, check_mtime: Option<i64>) -> bool;

    /// Fire-and-forget generation request.
    fn create(&self, request: ThumbnailRequest);

    /// Persist thumbnail bytes that came embedded in the media file.
    fn store_embedded(&self, image: &Path, size: ThumbSize, bytes: &[u8]) -> Result<()>;
}

/// Thumbnailing disabled: everything counts as fresh.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullThumbnailer;

impl Thumbnailer for NullThumbnailer {
    fn is_fresh(&self, _image: &Path, _size: ThumbSize, _check_mtime: Option<i64>) -> bool {
        true
    }

    fn create(&self, _request: ThumbnailRequest) {}

    fn store_embedded(&self, _image: &Path, _size: ThumbSize, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// On-disk thumbnail cache keyed by a hash of the source path and size.
///
/// Generation requests are forwarded to whoever holds the receiver returned
/// by [`ThumbnailCache::new`].
pub struct ThumbnailCache {
    dir: PathBuf,
    requests: mpsc::Sender<ThumbnailRequest>,
}

impl fmt::Debug for ThumbnailCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailCache")
            .field("dir", &self.dir)
            .field("queued", &(self.requests.max_capacity() - self.requests.capacity()))
            .finish()
    }
}

impl ThumbnailCache {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> (Self, mpsc::Receiver<ThumbnailRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                dir: dir.into(),
                requests: tx,
            },
            rx,
        )
    }

    /// Where the thumbnail of `image` at `size` lives.
    pub fn path_for(&self, image: &Path, size: ThumbSize) -> PathBuf {
        let key = encode_hash(&[&image.to_string_lossy(), size.as_str()]);
        self.dir.join(size.as_str()).join(format!("{key}.jpg"))
    }
}

impl Thumbnailer for ThumbnailCache {
    fn is_fresh(&self, image: &Path, size: ThumbSize, check_mtime: Option<i64>) -> bool {
        let Ok(meta) = std::fs::metadata(self.path_for(image, size)) else {
            return false;
        };
        match (check_mtime, mtime_ms(&meta)) {
            (Some(source), Some(thumb)) => thumb >= source,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    fn create(&self, request: ThumbnailRequest) {
        if let Err(err) = self.requests.try_send(request) {
            debug!("thumbnail request dropped: {}", err);
        }
    }

    fn store_embedded(&self, image: &Path, size: ThumbSize, bytes: &[u8]) -> Result<()> {
        let target = self.path_for(image, size);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, bytes)?;
        Ok(())
    }
}

fn encode_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn embedded_thumbnails_are_fresh_afterwards() {
        let tmp = tempdir().unwrap();
        let (cache, _rx) = ThumbnailCache::new(tmp.path(), 4);
        let image = Path::new("/m/a/cover.jpg");

        assert!(!cache.is_fresh(image, ThumbSize::Large, Some(0)));
        cache
            .store_embedded(image, ThumbSize::Large, b"jpeg")
            .unwrap();
        assert!(cache.is_fresh(image, ThumbSize::Large, Some(0)));
        assert!(!cache.is_fresh(image, ThumbSize::Small, None));
        // A source newer than the thumbnail makes it stale.
        assert!(!cache.is_fresh(image, ThumbSize::Large, Some(i64::MAX)));
    }

    #[test]
    fn keys_differ_by_size_and_path() {
        let (cache, _rx) = ThumbnailCache::new("/cache", 1);
        let a = cache.path_for(Path::new("/m/a.jpg"), ThumbSize::Large);
        let b = cache.path_for(Path::new("/m/a.jpg"), ThumbSize::Small);
        let c = cache.path_for(Path::new("/m/b.jpg"), ThumbSize::Large);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/cache/large"));
    }

    #[tokio::test]
    async fn requests_reach_the_generator() {
        let (cache, mut rx) = ThumbnailCache::new("/cache", 1);
        let request = ThumbnailRequest {
            source: PathBuf::from("/m/a.mkv"),
            size: ThumbSize::Large,
            priority: ThumbPriority::Low,
            still_frame: true,
            check_mtime: Some(5),
        };
        cache.create(request.clone());
        // Full channel drops instead of blocking.
        cache.create(request.clone());
        assert_eq!(rx.recv().await, Some(request));
        assert!(rx.try_recv().is_err());
    }
}

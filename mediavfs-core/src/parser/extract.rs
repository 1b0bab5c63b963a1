use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use crate::item::{AttributeBag, ItemKind, TrackInfo, extension_of};

pub const DEFAULT_VIDEO_FILE_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "webm", "flv", "wmv", "m4v", "mpg", "mpeg", "ts", "m2ts", "vob",
];

pub const DEFAULT_AUDIO_FILE_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "opus", "m4a", "aac", "wav", "wma", "ape", "wv",
];

pub const DEFAULT_IMAGE_FILE_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"];

/// Disc image files handled as multi-track containers.
pub const DISC_IMAGE_EXTENSIONS: &[&str] = &["iso"];

/// Metadata extraction collaborator. Never fails: an unreadable file yields
/// an empty bag.
#[async_trait]
pub trait Extractor: Send + Sync + fmt::Debug {
    async fn extract(&self, path: &Path, is_dir: bool) -> AttributeBag;
}

/// Folder layouts of authored discs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscLayout {
    /// `VIDEO_TS` directory.
    Dvd(PathBuf),
    /// `BDMV` directory.
    BluRay(PathBuf),
}

impl DiscLayout {
    pub fn subtype(&self) -> &'static str {
        match self {
            DiscLayout::Dvd(_) => "dvd",
            DiscLayout::BluRay(_) => "bluray",
        }
    }

    pub fn root(&self) -> &Path {
        match self {
            DiscLayout::Dvd(path) | DiscLayout::BluRay(path) => path,
        }
    }
}

/// Detect a disc folder structure directly below `dir`.
pub fn disc_layout(dir: &Path) -> Option<DiscLayout> {
    for name in ["VIDEO_TS", "video_ts"] {
        let candidate = dir.join(name);
        if candidate.is_dir() {
            return Some(DiscLayout::Dvd(candidate));
        }
    }
    for name in ["BDMV", "bdmv"] {
        let candidate = dir.join(name);
        if candidate.is_dir() {
            return Some(DiscLayout::BluRay(candidate));
        }
    }
    None
}

/// Every regular file inside the disc structure, depth-limited.
pub fn disc_files(layout: &DiscLayout) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![(layout.root().to_path_buf(), 0usize)];
    while let Some((dir, depth)) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(kind) if kind.is_dir() && depth < 4 => stack.push((path, depth + 1)),
                Ok(kind) if kind.is_file() => out.push(path),
                _ => {}
            }
        }
    }
    out.sort();
    out
}

/// Titles of an authored disc: DVD title sets (`VTS_NN_0.IFO`) or Blu-ray
/// playlists (`PLAYLIST/NNNNN.mpls`).
pub fn disc_tracks(layout: &DiscLayout) -> Vec<TrackInfo> {
    let mut numbers: Vec<u32> = match layout {
        DiscLayout::Dvd(root) => list_names(root)
            .into_iter()
            .filter_map(|name| {
                let upper = name.to_ascii_uppercase();
                let rest = upper.strip_prefix("VTS_")?.strip_suffix("_0.IFO")?;
                rest.parse().ok()
            })
            .collect(),
        DiscLayout::BluRay(root) => list_names(&root.join("PLAYLIST"))
            .into_iter()
            .filter_map(|name| {
                let lower = name.to_ascii_lowercase();
                lower.strip_suffix(".mpls")?.parse().ok()
            })
            .collect(),
    };
    numbers.sort_unstable();
    numbers.dedup();
    numbers
        .into_iter()
        .map(|number| TrackInfo {
            number,
            title: Some(format!("Title {number}")),
            length: None,
        })
        .collect()
}

fn list_names(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// Classifies by extension and disc layout; reads no file contents.
#[derive(Clone, Debug)]
pub struct ExtensionExtractor {
    video: Vec<String>,
    audio: Vec<String>,
    image: Vec<String>,
}

impl Default for ExtensionExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|ext| ext.to_string()).collect()
}

impl ExtensionExtractor {
    pub fn new() -> Self {
        Self {
            video: owned(DEFAULT_VIDEO_FILE_EXTENSIONS),
            audio: owned(DEFAULT_AUDIO_FILE_EXTENSIONS),
            image: owned(DEFAULT_IMAGE_FILE_EXTENSIONS),
        }
    }

    /// Kind implied by the file extension alone.
    pub fn classify_file(&self, path: &Path) -> ItemKind {
        let Some(ext) = extension_of(path) else {
            return ItemKind::File;
        };
        let has = |list: &[String]| list.iter().any(|known| known.eq_ignore_ascii_case(&ext));
        if has(&self.video) {
            ItemKind::Video
        } else if has(&self.audio) {
            ItemKind::Audio
        } else if has(&self.image) {
            ItemKind::Image
        } else if DISC_IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            ItemKind::Disc
        } else {
            ItemKind::File
        }
    }
}

#[async_trait]
impl Extractor for ExtensionExtractor {
    async fn extract(&self, path: &Path, is_dir: bool) -> AttributeBag {
        if !is_dir {
            let kind = self.classify_file(path);
            return AttributeBag {
                kind: Some(kind),
                subtype: (kind == ItemKind::Disc).then(|| "iso".to_string()),
                ..AttributeBag::default()
            };
        }

        let dir = path.to_path_buf();
        let probed = tokio::task::spawn_blocking(move || {
            disc_layout(&dir).map(|layout| (layout.subtype(), disc_tracks(&layout)))
        })
        .await;

        match probed {
            Ok(Some((subtype, tracks))) => AttributeBag {
                kind: Some(ItemKind::Disc),
                subtype: Some(subtype.to_string()),
                tracks,
                ..AttributeBag::default()
            },
            Ok(None) => AttributeBag {
                kind: Some(ItemKind::Directory),
                ..AttributeBag::default()
            },
            Err(err) => {
                warn!(path = %path.display(), "disc probe failed: {}", err);
                AttributeBag::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn extensions_map_to_kinds() {
        let extractor = ExtensionExtractor::new();
        assert_eq!(extractor.classify_file(Path::new("/m/a.MKV")), ItemKind::Video);
        assert_eq!(extractor.classify_file(Path::new("/m/a.flac")), ItemKind::Audio);
        assert_eq!(extractor.classify_file(Path::new("/m/a.jpeg")), ItemKind::Image);
        assert_eq!(extractor.classify_file(Path::new("/m/a.iso")), ItemKind::Disc);
        assert_eq!(extractor.classify_file(Path::new("/m/a.nfo")), ItemKind::File);
        assert_eq!(extractor.classify_file(Path::new("/m/README")), ItemKind::File);
    }

    #[tokio::test]
    async fn dvd_folders_become_discs_with_title_sets() {
        let tmp = tempdir().unwrap();
        let video_ts = tmp.path().join("VIDEO_TS");
        std::fs::create_dir(&video_ts).unwrap();
        for name in ["VIDEO_TS.IFO", "VTS_01_0.IFO", "VTS_01_1.VOB", "VTS_02_0.IFO"] {
            std::fs::write(video_ts.join(name), b"x").unwrap();
        }

        let bag = ExtensionExtractor::new().extract(tmp.path(), true).await;
        assert_eq!(bag.kind, Some(ItemKind::Disc));
        assert_eq!(bag.subtype.as_deref(), Some("dvd"));
        let numbers: Vec<_> = bag.tracks.iter().map(|t| t.number).collect();
        assert_eq!(numbers, [1, 2]);

        let layout = disc_layout(tmp.path()).unwrap();
        assert_eq!(disc_files(&layout).len(), 4);
    }

    #[tokio::test]
    async fn plain_directories_stay_directories() {
        let tmp = tempdir().unwrap();
        let bag = ExtensionExtractor::new().extract(tmp.path(), true).await;
        assert_eq!(bag.kind, Some(ItemKind::Directory));
        assert!(bag.tracks.is_empty());
    }
}

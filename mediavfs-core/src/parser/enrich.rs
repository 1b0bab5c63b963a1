use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::item::{Attributes, Item};
use crate::listing::ListingEntry;

/// Post-extraction hook keyed by file extension.
#[async_trait]
pub trait Enricher: Send + Sync + fmt::Debug {
    /// Lowercase extensions this enricher applies to.
    fn extensions(&self) -> &[&'static str];

    /// `siblings` is the merged listing of the item's directory when the
    /// caller already has it.
    async fn enrich(&self, item: &Item, attrs: &mut Attributes, siblings: &[ListingEntry]);
}

/// Enrichers by extension, applied in registration order.
#[derive(Clone, Default)]
pub struct EnricherRegistry {
    by_extension: HashMap<String, Vec<Arc<dyn Enricher>>>,
}

impl fmt::Debug for EnricherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut extensions: Vec<_> = self.by_extension.keys().collect();
        extensions.sort();
        f.debug_struct("EnricherRegistry")
            .field("extensions", &extensions)
            .finish()
    }
}

impl EnricherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in enrichers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SidecarSubtitleEnricher));
        registry
    }

    pub fn register(&mut self, enricher: Arc<dyn Enricher>) {
        for ext in enricher.extensions() {
            self.by_extension
                .entry(ext.to_ascii_lowercase())
                .or_default()
                .push(Arc::clone(&enricher));
        }
    }

    pub fn for_extension(&self, ext: &str) -> &[Arc<dyn Enricher>] {
        self.by_extension
            .get(&ext.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_extension.is_empty()
    }
}

const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "ass", "ssa", "vtt", "sub"];

/// Records subtitle files sharing the video's base name, including those
/// kept in the overlay directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct SidecarSubtitleEnricher;

#[async_trait]
impl Enricher for SidecarSubtitleEnricher {
    fn extensions(&self) -> &[&'static str] {
        super::extract::DEFAULT_VIDEO_FILE_EXTENSIONS
    }

    async fn enrich(&self, item: &Item, attrs: &mut Attributes, siblings: &[ListingEntry]) {
        let Some(stem) = item.path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            return;
        };
        let found: Vec<&str> = siblings
            .iter()
            .filter(|entry| !entry.is_dir && entry.path != item.path)
            .filter(|entry| {
                let Some((base, ext)) = entry.name.rsplit_once('.') else {
                    return false;
                };
                let ext = ext.to_ascii_lowercase();
                SUBTITLE_EXTENSIONS.contains(&ext.as_str())
                    && (base == stem || base.starts_with(&format!("{stem}.")))
            })
            .map(|entry| entry.name.as_str())
            .collect();

        if found.is_empty() {
            attrs.extra.remove("subtitles");
        } else {
            attrs.extra.insert("subtitles".into(), found.join(","));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::item::ParentRef;

    fn entry(name: &str, overlay: bool) -> ListingEntry {
        ListingEntry {
            path: PathBuf::from("/m").join(name),
            name: name.to_string(),
            is_dir: false,
            is_symlink: false,
            is_overlay: overlay,
            len: 1,
            mtime_ms: Some(1),
        }
    }

    #[tokio::test]
    async fn subtitles_sharing_the_base_name_are_recorded() {
        let item = Item::placeholder("/m/film.mkv", ParentRef::Root, false);
        let siblings = [
            entry("film.en.srt", false),
            entry("film.mkv", false),
            entry("film.vtt", true),
            entry("other.srt", false),
        ];
        let mut attrs = Attributes::default();
        SidecarSubtitleEnricher
            .enrich(&item, &mut attrs, &siblings)
            .await;
        assert_eq!(
            attrs.extra.get("subtitles").map(String::as_str),
            Some("film.en.srt,film.vtt")
        );
    }

    #[test]
    fn registry_is_keyed_by_extension() {
        let registry = EnricherRegistry::with_defaults();
        assert_eq!(registry.for_extension("MKV").len(), 1);
        assert!(registry.for_extension("mp3").is_empty());
    }
}

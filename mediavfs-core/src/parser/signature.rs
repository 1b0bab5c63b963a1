use std::path::Path;

use crate::listing::{ListingEntry, mtime_ms};

use super::extract::{disc_files, disc_layout};

/// Modification signature of an item in milliseconds.
///
/// Media files add the mtimes of sibling sidecars sharing their base name, so
/// editing a subtitle or poster re-parses the media file. Disc folders sum
/// every file in the disc structure. `None` when the path vanished.
pub async fn signature(path: &Path, is_dir: bool, siblings: &[ListingEntry]) -> Option<i64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let own = mtime_ms(&meta).unwrap_or(0);

    if is_dir {
        let dir = path.to_path_buf();
        let disc_sum = tokio::task::spawn_blocking(move || {
            let layout = disc_layout(&dir)?;
            let files = disc_files(&layout);
            if files.is_empty() {
                return None;
            }
            Some(files.iter().fold(0i64, |acc, file| {
                let mtime = std::fs::metadata(file)
                    .ok()
                    .and_then(|meta| mtime_ms(&meta))
                    .unwrap_or(0);
                acc.saturating_add(mtime)
            }))
        })
        .await
        .ok()
        .flatten();
        return Some(disc_sum.unwrap_or(own));
    }

    // `film.mkv` owns `film.en.srt`, `film.jpg`, `film.nfo`.
    let prefix = format!("{}.", path.file_stem()?.to_string_lossy());
    let sidecars = siblings
        .iter()
        .filter(|entry| !entry.is_dir && entry.path != path && entry.name.starts_with(&prefix))
        .filter_map(|entry| entry.mtime_ms)
        .fold(0i64, i64::saturating_add);
    Some(own.saturating_add(sidecars))
}

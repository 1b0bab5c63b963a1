use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use ffmpeg_next as ffmpeg;
use tracing::{debug, info, warn};

use super::extract::{ExtensionExtractor, Extractor};
use super::title::split_track_prefix;
use crate::item::{AttributeBag, ItemKind};

static FFMPEG_READY: OnceLock<bool> = OnceLock::new();

fn ensure_init() -> bool {
    *FFMPEG_READY.get_or_init(|| match ffmpeg::init() {
        Ok(()) => {
            info!("FFmpeg initialized successfully");
            true
        }
        Err(err) => {
            warn!("FFmpeg initialization failed: {}", err);
            false
        }
    })
}

/// Probes audio and video containers with FFmpeg for tags, duration and
/// stream details. Everything else is classified like
/// [`ExtensionExtractor`].
#[derive(Clone, Debug, Default)]
pub struct FfmpegExtractor {
    fallback: ExtensionExtractor,
}

impl FfmpegExtractor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Extractor for FfmpegExtractor {
    async fn extract(&self, path: &Path, is_dir: bool) -> AttributeBag {
        let mut bag = self.fallback.extract(path, is_dir).await;
        if !matches!(bag.kind, Some(ItemKind::Audio | ItemKind::Video)) {
            return bag;
        }

        let file = path.to_path_buf();
        match tokio::task::spawn_blocking(move || probe(&file)).await {
            Ok(Ok(probed)) => probed.merge_into(&mut bag),
            Ok(Err(err)) => {
                debug!(path = %path.display(), "ffmpeg probe failed: {}", err);
            }
            Err(err) => {
                warn!(path = %path.display(), "ffmpeg probe panicked: {}", err);
            }
        }
        bag
    }
}

#[derive(Debug, Default)]
struct Probed {
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    track: Option<u32>,
    length: Option<f64>,
    video_codec: Option<String>,
    dimensions: Option<(u32, u32)>,
    has_cover: bool,
}

impl Probed {
    fn merge_into(self, bag: &mut AttributeBag) {
        bag.title = self.title.or(bag.title.take());
        bag.artist = self.artist;
        bag.album = self.album;
        bag.length = self.length;
        if let Some(track) = self.track {
            bag.extra.insert("track".into(), track.to_string());
        }
        if let Some(codec) = self.video_codec {
            bag.extra.insert("video_codec".into(), codec);
        }
        if let Some((width, height)) = self.dimensions {
            bag.extra.insert("width".into(), width.to_string());
            bag.extra.insert("height".into(), height.to_string());
        }
        if self.has_cover {
            bag.extra.insert("embedded_cover".into(), "true".into());
        }
    }
}

fn probe(path: &Path) -> std::result::Result<Probed, ffmpeg::Error> {
    if !ensure_init() {
        return Err(ffmpeg::Error::Unknown);
    }
    let input = ffmpeg::format::input(path)?;
    let mut probed = Probed::default();

    if input.duration() != ffmpeg::ffi::AV_NOPTS_VALUE && input.duration() > 0 {
        probed.length = Some(input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64);
    }

    let tags = input.metadata();
    let tag = |key: &str| {
        tags.get(key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    probed.title = tag("title");
    probed.artist = tag("artist").or_else(|| tag("album_artist"));
    probed.album = tag("album");
    probed.track = tag("track").and_then(|raw| {
        // "3/12" or "03 - Name"
        let head = raw.split('/').next().unwrap_or_default().trim().to_string();
        head.parse()
            .ok()
            .or_else(|| split_track_prefix(&raw).map(|(no, _)| no))
    });

    let mut best_width = 0;
    for stream in input.streams() {
        if stream
            .disposition()
            .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC)
        {
            probed.has_cover = true;
            continue;
        }
        let Ok(codec) = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        else {
            continue;
        };
        if codec.medium() != ffmpeg::media::Type::Video {
            continue;
        }
        if let Ok(video) = codec.decoder().video()
            && video.width() > best_width
        {
            best_width = video.width();
            probed.dimensions = Some((video.width(), video.height()));
            probed.video_codec = video.codec().map(|c| c.name().to_string());
        }
    }

    Ok(probed)
}

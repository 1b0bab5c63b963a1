use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{
    AccessKind, AccessMode, CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode,
};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{EventMask, WatchBackend, WatchEvent};
use crate::error::{IndexError, Result};

/// A rename source not paired with its destination within this window is
/// treated as a move out of the watched tree.
const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(250);

enum WatchMessage {
    Event(Event),
    Error(notify::Error),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event(event) => f
                .debug_struct("WatchMessage::Event")
                .field("kind", &event.kind)
                .field("path_count", &event.paths.len())
                .finish(),
            WatchMessage::Error(err) => f
                .debug_struct("WatchMessage::Error")
                .field("message", &err.to_string())
                .finish(),
        }
    }
}

/// [`WatchBackend`] on top of `notify`, one non-recursive watch per directory.
pub struct NotifyBackend {
    watcher: Mutex<RecommendedWatcher>,
    watched: Arc<Mutex<HashSet<PathBuf>>>,
    translator: JoinHandle<()>,
}

impl fmt::Debug for NotifyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyBackend")
            .field("watched", &self.watched.lock().len())
            .field("translator_finished", &self.translator.is_finished())
            .finish()
    }
}

impl Drop for NotifyBackend {
    fn drop(&mut self) {
        self.translator.abort();
    }
}

impl NotifyBackend {
    /// Create the backend and the stream of translated events.
    ///
    /// Must be called inside a tokio runtime; the translator runs as a task.
    pub fn new(capacity: usize) -> Result<(Self, mpsc::Receiver<WatchEvent>)> {
        let capacity = capacity.max(16);
        let (raw_tx, raw_rx) = mpsc::channel::<WatchMessage>(capacity);
        let (tx, rx) = mpsc::channel::<WatchEvent>(capacity);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let msg = match res {
                    Ok(event) => WatchMessage::Event(event),
                    Err(err) => WatchMessage::Error(err),
                };
                if let Err(err) = raw_tx.blocking_send(msg) {
                    debug!("watch channel closed: {}", err);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|err| IndexError::Internal(format!("failed to create watcher: {err}")))?;

        let watched = Arc::new(Mutex::new(HashSet::new()));
        let translator = spawn_translator(raw_rx, tx, Arc::clone(&watched));

        Ok((
            Self {
                watcher: Mutex::new(watcher),
                watched,
                translator,
            },
            rx,
        ))
    }
}

impl WatchBackend for NotifyBackend {
    fn watch(&self, dir: &Path) -> Result<bool> {
        if self.watched.lock().contains(dir) {
            return Ok(true);
        }
        self.watcher
            .lock()
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|err| IndexError::Watch {
                path: dir.to_path_buf(),
                message: err.to_string(),
            })?;
        self.watched.lock().insert(dir.to_path_buf());
        Ok(true)
    }

    fn unwatch(&self, dir: &Path) {
        if !self.watched.lock().remove(dir) {
            return;
        }
        if let Err(err) = self.watcher.lock().unwatch(dir) {
            // The directory is usually already gone.
            debug!(path = %dir.display(), error = %err, "unwatch failed");
        }
    }
}

fn spawn_translator(
    mut rx: mpsc::Receiver<WatchMessage>,
    tx: mpsc::Sender<WatchEvent>,
    watched: Arc<Mutex<HashSet<PathBuf>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // rename tracker -> source path
        let mut unpaired: HashMap<usize, PathBuf> = HashMap::new();

        loop {
            let msg = if unpaired.is_empty() {
                rx.recv().await
            } else {
                match timeout(RENAME_PAIR_WINDOW, rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        for (_, from) in unpaired.drain() {
                            if tx.send(WatchEvent::new(EventMask::DELETE, from)).await.is_err() {
                                return;
                            }
                        }
                        continue;
                    }
                }
            };

            let Some(msg) = msg else {
                break;
            };

            let events = match msg {
                WatchMessage::Event(event) => translate(event, &mut unpaired, &watched),
                WatchMessage::Error(err) => {
                    warn!("filesystem watch error: {}", err);
                    let paths = if err.paths.is_empty() {
                        top_level(&watched.lock())
                    } else {
                        err.paths
                    };
                    paths
                        .into_iter()
                        .map(|path| WatchEvent::new(EventMask::OVERFLOW, path))
                        .collect()
                }
            };

            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    })
}

fn translate(
    event: Event,
    unpaired: &mut HashMap<usize, PathBuf>,
    watched: &Mutex<HashSet<PathBuf>>,
) -> Vec<WatchEvent> {
    if event.need_rescan() || matches!(event.kind, EventKind::Other) {
        let paths = if event.paths.is_empty() {
            top_level(&watched.lock())
        } else {
            event.paths
        };
        return paths
            .into_iter()
            .map(|path| WatchEvent::new(EventMask::OVERFLOW, path))
            .collect();
    }

    let tracker = event.attrs.tracker();
    let mut paths = event.paths.into_iter();
    let Some(first) = paths.next() else {
        return Vec::new();
    };

    let single = |mask: EventMask| vec![WatchEvent::new(mask, first.clone())];

    match event.kind {
        EventKind::Create(kind) => {
            let is_dir = match kind {
                CreateKind::Folder => true,
                CreateKind::File => false,
                _ => first.is_dir(),
            };
            if is_dir {
                single(EventMask::CREATE | EventMask::ISDIR)
            } else {
                single(EventMask::CREATE)
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.next() {
            Some(to) => vec![WatchEvent::moved(first.clone(), to)],
            None => single(EventMask::CREATE),
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => match tracker {
            Some(tracker) => {
                unpaired.insert(tracker, first.clone());
                Vec::new()
            }
            None => single(EventMask::DELETE),
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            // A paired destination is reported again as `Both`.
            if tracker.is_some_and(|tracker| unpaired.remove(&tracker).is_some()) {
                Vec::new()
            } else {
                single(EventMask::CREATE)
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            if first.exists() {
                single(EventMask::CREATE)
            } else {
                single(EventMask::DELETE)
            }
        }
        EventKind::Modify(_) => single(EventMask::MODIFY),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => single(EventMask::CLOSE_WRITE),
        EventKind::Access(_) => Vec::new(),
        EventKind::Remove(RemoveKind::Other) => single(EventMask::UNMOUNT),
        EventKind::Remove(kind) => {
            if watched.lock().contains(&first) {
                single(EventMask::DELETE_SELF | EventMask::ISDIR)
            } else if matches!(kind, RemoveKind::Folder) {
                single(EventMask::DELETE | EventMask::ISDIR)
            } else {
                single(EventMask::DELETE)
            }
        }
        EventKind::Any | EventKind::Other => single(EventMask::OVERFLOW),
    }
}

/// Watched directories without a watched ancestor.
fn top_level(watched: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = watched
        .iter()
        .filter(|path| {
            !path
                .ancestors()
                .skip(1)
                .any(|ancestor| watched.contains(ancestor))
        })
        .cloned()
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::Flag;

    fn translate_one(event: Event, unpaired: &mut HashMap<usize, PathBuf>) -> Vec<WatchEvent> {
        let watched = Mutex::new(HashSet::from([PathBuf::from("/m")]));
        translate(event, unpaired, &watched)
    }

    #[test]
    fn rename_halves_pair_into_one_move() {
        let mut unpaired = HashMap::new();
        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(PathBuf::from("/m/a.mp3"))
            .set_tracker(7);
        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(PathBuf::from("/m/b.mp3"))
            .set_tracker(7);
        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/m/a.mp3"))
            .add_path(PathBuf::from("/m/b.mp3"))
            .set_tracker(7);

        assert!(translate_one(from, &mut unpaired).is_empty());
        assert!(translate_one(to, &mut unpaired).is_empty());
        assert!(unpaired.is_empty());
        assert_eq!(
            translate_one(both, &mut unpaired),
            [WatchEvent::moved("/m/a.mp3", "/m/b.mp3")]
        );
    }

    #[test]
    fn removal_of_watched_directory_is_delete_self() {
        let mut unpaired = HashMap::new();
        let event = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(PathBuf::from("/m"));
        assert_eq!(
            translate_one(event, &mut unpaired),
            [WatchEvent::new(EventMask::DELETE_SELF | EventMask::ISDIR, "/m")]
        );
    }

    #[test]
    fn rescan_flag_becomes_overflow() {
        let mut unpaired = HashMap::new();
        let event = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(
            translate_one(event, &mut unpaired),
            [WatchEvent::new(EventMask::OVERFLOW, "/m")]
        );
    }

    #[test]
    fn close_write_is_reported() {
        let mut unpaired = HashMap::new();
        let event = Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)))
            .add_path(PathBuf::from("/m/a.mkv"));
        assert_eq!(
            translate_one(event, &mut unpaired),
            [WatchEvent::new(EventMask::CLOSE_WRITE, "/m/a.mkv")]
        );
    }

    #[tokio::test]
    async fn watches_real_directory_creations() {
        let tmp = tempfile::tempdir().unwrap();
        let (backend, mut rx) = NotifyBackend::new(64).unwrap();
        assert!(backend.watch(tmp.path()).unwrap());

        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event delivered")
            .expect("channel open");
        assert!(event.mask.contains(EventMask::CREATE));
        assert_eq!(event.path, tmp.path().join("sub"));
    }
}

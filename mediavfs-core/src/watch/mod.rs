//! OS change-notification collaborator.
//!
//! Backends deliver [`WatchEvent`]s; the crawler owns the [`WatchTable`]
//! recording which directories have a live watch.

use std::fmt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::error::Result;

#[cfg(feature = "watch")]
mod notify;
mod table;

#[cfg(feature = "watch")]
pub use notify::NotifyBackend;
pub use table::WatchTable;

bitflags! {
    /// Change classes carried by a [`WatchEvent`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const MODIFY = 1 << 0;
        const CLOSE_WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const DELETE = 1 << 3;
        const DELETE_SELF = 1 << 4;
        const UNMOUNT = 1 << 5;
        const MOVE = 1 << 6;
        /// The subject is a directory.
        const ISDIR = 1 << 7;
        /// The backend dropped events; the path must be rescanned.
        const OVERFLOW = 1 << 8;
    }
}

/// One live change notification.
#[derive(Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub mask: EventMask,
    pub path: PathBuf,
    /// Destination of a MOVE.
    pub move_target: Option<PathBuf>,
}

impl fmt::Debug for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WatchEvent");
        debug.field("mask", &self.mask).field("path", &self.path);
        if let Some(target) = &self.move_target {
            debug.field("move_target", target);
        }
        debug.finish()
    }
}

impl WatchEvent {
    pub fn new(mask: EventMask, path: impl Into<PathBuf>) -> Self {
        Self {
            mask,
            path: path.into(),
            move_target: None,
        }
    }

    pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            mask: EventMask::MOVE,
            path: from.into(),
            move_target: Some(to.into()),
        }
    }

    pub fn with_dir(mut self) -> Self {
        self.mask |= EventMask::ISDIR;
        self
    }
}

/// Per-directory, non-recursive change notification.
pub trait WatchBackend: Send + Sync + fmt::Debug {
    /// Start watching `dir`. `Ok(false)` means the backend cannot watch this
    /// path natively and it must be covered by polling.
    fn watch(&self, dir: &Path) -> Result<bool>;

    fn unwatch(&self, dir: &Path);
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Watched directories.
///
/// `true` marks a live OS watch; `false` marks a directory tracked without
/// native support and covered by the periodic restart pass. Symlinked
/// directories are watched at their real path and recorded as aliases so
/// events on the target are reported at the link.
#[derive(Clone, Debug, Default)]
pub struct WatchTable {
    entries: HashMap<PathBuf, bool>,
    /// real path -> link path
    aliases: HashMap<PathBuf, PathBuf>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: PathBuf, live: bool) {
        self.entries.insert(path, live);
    }

    pub fn get(&self, path: &Path) -> Option<bool> {
        self.entries.get(path).copied()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that `link` is served by the watch on `real`. Only for targets
    /// outside every crawled root; a target inside one is watched as itself.
    pub fn add_alias(&mut self, real: PathBuf, link: PathBuf) {
        self.aliases.insert(real, link);
    }

    /// Map a path under a watched symlink target back onto the link.
    pub fn resolve_alias(&self, path: &Path) -> Option<PathBuf> {
        self.aliases
            .iter()
            .filter(|(real, _)| path.starts_with(real))
            .max_by_key(|(real, _)| real.components().count())
            .map(|(real, link)| {
                let rest = path.strip_prefix(real).unwrap_or(Path::new(""));
                if rest.as_os_str().is_empty() {
                    link.clone()
                } else {
                    link.join(rest)
                }
            })
    }

    /// Remove `path` and everything below it, including watched symlink
    /// targets that alias into the subtree. Returns the removed entries.
    pub fn remove_subtree(&mut self, path: &Path) -> Vec<(PathBuf, bool)> {
        let aliased: Vec<PathBuf> = self
            .aliases
            .iter()
            .filter(|(_, link)| link.starts_with(path))
            .map(|(real, _)| real.clone())
            .collect();

        let mut removed = Vec::new();
        self.entries.retain(|entry, live| {
            let doomed = entry.starts_with(path)
                || aliased.iter().any(|real| entry.starts_with(real));
            if doomed {
                removed.push((entry.clone(), *live));
            }
            !doomed
        });
        for real in aliased {
            self.aliases.remove(&real);
        }
        removed.sort();
        removed
    }

    fn is_link(&self, path: &Path) -> bool {
        self.aliases.values().any(|link| link == path)
    }

    /// Whether any directory is covered only by polling. Symlink entries are
    /// served by the watch on their target and do not count.
    pub fn has_polled(&self) -> bool {
        self.entries
            .iter()
            .any(|(path, live)| !live && !self.is_link(path))
    }

    pub fn polled(&self) -> Vec<PathBuf> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter(|(path, live)| !**live && !self.is_link(path))
            .map(|(path, _)| path.clone())
            .collect();
        out.sort();
        out
    }

    /// Drain every entry, returning the paths that had a live watch.
    pub fn clear(&mut self) -> Vec<PathBuf> {
        self.aliases.clear();
        let mut live: Vec<_> = self
            .entries
            .drain()
            .filter(|(_, live)| *live)
            .map(|(path, _)| path)
            .collect();
        live.sort();
        live
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

/// Shared set of registered crawl roots. Cloning shares the set.
#[derive(Clone, Debug, Default)]
pub struct RootSet {
    inner: Arc<RwLock<Vec<PathBuf>>>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the root was already registered.
    pub fn insert(&self, root: PathBuf) -> bool {
        let mut roots = self.inner.write();
        if roots.contains(&root) {
            return false;
        }
        roots.push(root);
        true
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner.read().iter().any(|root| root == path)
    }

    /// Innermost registered root containing `path`.
    pub fn root_of(&self, path: &Path) -> Option<PathBuf> {
        self.inner
            .read()
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .cloned()
    }

    pub fn all(&self) -> Vec<PathBuf> {
        self.inner.read().clone()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn innermost_root_wins() {
        let roots = RootSet::new();
        assert!(roots.insert(PathBuf::from("/media")));
        assert!(roots.insert(PathBuf::from("/media/music")));
        assert!(!roots.insert(PathBuf::from("/media")));

        assert_eq!(
            roots.root_of(Path::new("/media/music/a.mp3")),
            Some(PathBuf::from("/media/music"))
        );
        assert_eq!(
            roots.root_of(Path::new("/media/video/b.mkv")),
            Some(PathBuf::from("/media"))
        );
        assert_eq!(roots.root_of(Path::new("/srv/c.mkv")), None);
    }
}

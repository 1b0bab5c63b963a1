use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

/// One pending directory scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    pub directory: PathBuf,
    /// Enqueue subdirectories found by the scan.
    pub recursive: bool,
    /// Verify thumbnails even for items whose signature is unchanged.
    pub force_thumbnail_check: bool,
}

impl ScanRequest {
    pub fn new(directory: impl Into<PathBuf>, recursive: bool, force_thumbnail_check: bool) -> Self {
        Self {
            directory: directory.into(),
            recursive,
            force_thumbnail_check,
        }
    }
}

/// Scan queue keyed by directory path.
///
/// A path is queued at most once. Pushing an already queued path merges the
/// flags into the queued request and, for a front push, moves it forward.
#[derive(Debug, Default)]
pub struct ScanQueue {
    order: VecDeque<PathBuf>,
    requests: HashMap<PathBuf, ScanRequest>,
}

impl ScanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the path was not queued before.
    pub fn push(&mut self, request: ScanRequest, front: bool) -> bool {
        if let Some(queued) = self.requests.get_mut(&request.directory) {
            queued.recursive |= request.recursive;
            queued.force_thumbnail_check |= request.force_thumbnail_check;
            if front {
                self.order.retain(|path| path != &request.directory);
                self.order.push_front(request.directory);
            }
            return false;
        }

        if front {
            self.order.push_front(request.directory.clone());
        } else {
            self.order.push_back(request.directory.clone());
        }
        self.requests.insert(request.directory.clone(), request);
        true
    }

    pub fn pop(&mut self) -> Option<ScanRequest> {
        let path = self.order.pop_front()?;
        self.requests.remove(&path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.requests.contains_key(path)
    }

    /// Drop every queued scan at or below `path`. Returns how many went.
    pub fn remove_under(&mut self, path: &Path) -> usize {
        let before = self.order.len();
        self.order.retain(|queued| !queued.starts_with(path));
        self.requests.retain(|queued, _| !queued.starts_with(path));
        before - self.order.len()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.requests.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.order.iter().map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_twice_is_one_entry_with_merged_flags() {
        let mut queue = ScanQueue::new();
        assert!(queue.push(ScanRequest::new("/m/a", false, false), false));
        assert!(!queue.push(ScanRequest::new("/m/a", true, false), false));
        assert!(!queue.push(ScanRequest::new("/m/a", false, true), false));
        assert_eq!(queue.len(), 1);

        let request = queue.pop().unwrap();
        assert!(request.recursive);
        assert!(request.force_thumbnail_check);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn front_pushes_jump_the_queue() {
        let mut queue = ScanQueue::new();
        queue.push(ScanRequest::new("/m/a", true, false), false);
        queue.push(ScanRequest::new("/m/b", true, false), false);
        queue.push(ScanRequest::new("/m/live", false, false), true);
        queue.push(ScanRequest::new("/m/b", false, false), true);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|request| request.directory)
            .collect();
        assert_eq!(
            order,
            [
                PathBuf::from("/m/b"),
                PathBuf::from("/m/live"),
                PathBuf::from("/m/a")
            ]
        );
    }

    #[test]
    fn removing_a_subtree_keeps_siblings() {
        let mut queue = ScanQueue::new();
        for path in ["/m/a", "/m/a/b", "/m/ab", "/m/c"] {
            queue.push(ScanRequest::new(path, false, false), false);
        }
        assert_eq!(queue.remove_under(Path::new("/m/a")), 2);
        assert!(queue.contains(Path::new("/m/ab")));
        assert!(!queue.contains(Path::new("/m/a/b")));
        assert_eq!(queue.len(), 2);
    }
}

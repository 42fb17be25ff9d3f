use std::fs::{self, File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use lru::LruCache;

/// Lowest allowed open-file cap.
pub const MIN_OPEN_FILES: usize = 4;

/// Bounded pool of open files, least-recently-touched out first.
///
/// Eviction only drops the pool's handle; chunk mappings keep their own
/// `Arc<File>`, so a file is never yanked out from under an active window.
pub struct FilePool {
    files: Mutex<LruCache<PathBuf, Arc<File>>>,
}

impl FilePool {
    pub fn new(max_open: usize) -> Self {
        let cap = NonZeroUsize::new(max_open.max(MIN_OPEN_FILES)).unwrap();
        Self {
            files: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.files.lock().unwrap().cap().get()
    }

    pub fn len(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open (or fetch) a read-write file, growing it to `length` so every
    /// window of it maps cleanly.
    pub fn open(&self, path: &Path, length: u64) -> io::Result<Arc<File>> {
        let mut files = self.files.lock().unwrap();

        if let Some(f) = files.get(path) {
            return Ok(f.clone());
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if file.metadata()?.len() < length {
            file.set_len(length)?;
        }

        let file = Arc::new(file);
        files.push(path.to_path_buf(), file.clone());
        Ok(file)
    }

    /// Drop the pooled handle for a path, if present.
    pub fn close(&self, path: &Path) {
        self.files.lock().unwrap().pop(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_floor() {
        assert_eq!(FilePool::new(0).capacity(), MIN_OPEN_FILES);
        assert_eq!(FilePool::new(1).capacity(), MIN_OPEN_FILES);
        assert_eq!(FilePool::new(64).capacity(), 64);
    }

    #[test]
    fn evicts_least_recently_touched() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FilePool::new(4);

        let paths: Vec<_> = (0..5).map(|i| dir.path().join(format!("f{}", i))).collect();
        for p in &paths[..4] {
            pool.open(p, 16).unwrap();
        }
        assert_eq!(pool.len(), 4);

        // Touch f0 so f1 becomes the eviction candidate.
        pool.open(&paths[0], 16).unwrap();
        pool.open(&paths[4], 16).unwrap();

        assert_eq!(pool.len(), 4);
        let inner = pool.files.lock().unwrap();
        assert!(inner.contains(&paths[0]));
        assert!(!inner.contains(&paths[1]));
    }

    #[test]
    fn grows_file_to_requested_length() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FilePool::new(4);
        let path = dir.path().join("data");

        let f = pool.open(&path, 4096).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 4096);

        // Re-opening with a smaller length must not truncate.
        pool.close(&path);
        let f = pool.open(&path, 16).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 4096);
    }

    #[test]
    fn evicted_handle_stays_usable() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FilePool::new(4);

        let held = pool.open(&dir.path().join("held"), 16).unwrap();
        for i in 0..4 {
            pool.open(&dir.path().join(format!("x{}", i)), 16).unwrap();
        }

        // "held" was evicted from the pool but our Arc keeps it alive.
        assert_eq!(held.metadata().unwrap().len(), 16);
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::storage::chunk::{Chunk, ChunkStorage};

bitflags::bitflags! {
    pub struct GetFlags: u32 {
        const WRITABLE = 1 << 0;
        const BLOCKING = 1 << 1;
        const NONBLOCK = 1 << 2;
        const DONT_LOG = 1 << 3;
    }
}

bitflags::bitflags! {
    pub struct ReleaseFlags: u32 {
        const SYNC = 1 << 0;
    }
}

bitflags::bitflags! {
    pub struct SyncFlags: u32 {
        const ALL          = 1 << 0;
        const FORCE        = 1 << 1;
        const SAFE         = 1 << 2;
        const SLOPPY       = 1 << 3;
        const USE_TIMEOUT  = 1 << 4;
        const IGNORE_ERROR = 1 << 5;
    }
}

/// Let writes age this long before the queue flushes them.
const SYNC_DELAY: Duration = Duration::from_secs(10);

/// Max gap between consecutive synced pieces within one pass; larger jumps
/// stay queued so adjacent writeback coalesces.
const MAX_SYNC_DISTANCE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Inactive,
    Pinned,
    Queued,
    Syncing,
}

struct ChunkNode {
    state: NodeState,
    refs: u32,
    writers: u32,
    chunk: Option<Arc<Chunk>>,
    dirty: bool,
    read_only: bool,
    queued_at: Option<Instant>,
}

impl ChunkNode {
    fn new() -> Self {
        Self {
            state: NodeState::Inactive,
            refs: 0,
            writers: 0,
            chunk: None,
            dirty: false,
            read_only: false,
            queued_at: None,
        }
    }
}

/// A pinned piece. Must be given back through [`ChunkList::release`].
#[derive(Debug)]
pub struct ChunkHandle {
    pub index: u32,
    writable: bool,
}

impl ChunkHandle {
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

type StorageErrorCb = Box<dyn Fn(&str) + Send>;

/// Owns the per-torrent chunk nodes: pin counting, lazy mapping, and the
/// writeback queue.
pub struct ChunkList {
    storage: ChunkStorage,
    nodes: Vec<ChunkNode>,
    queue: Vec<u32>,
    on_storage_error: Option<StorageErrorCb>,
}

impl ChunkList {
    pub fn new(storage: ChunkStorage) -> Self {
        let n = storage.num_pieces() as usize;
        Self {
            storage,
            nodes: (0..n).map(|_| ChunkNode::new()).collect(),
            queue: Vec::new(),
            on_storage_error: None,
        }
    }

    pub fn set_storage_error_cb(&mut self, cb: StorageErrorCb) {
        self.on_storage_error = Some(cb);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn has_outstanding_handles(&self) -> bool {
        self.nodes.iter().any(|n| n.refs > 0)
    }

    /// Pin a piece, mapping it on first use.
    pub fn get(&mut self, index: u32, flags: GetFlags) -> Result<ChunkHandle> {
        let node = self
            .nodes
            .get_mut(index as usize)
            .ok_or_else(|| Error::input(format!("Piece {} out of range", index)))?;

        let writable = flags.contains(GetFlags::WRITABLE);
        if writable && node.read_only {
            return Err(Error::Storage(format!(
                "Piece {} is read-only after a storage failure",
                index
            )));
        }

        if node.state == NodeState::Syncing {
            // Unreachable to new pinners until writeback finishes.
            return Err(Error::WouldBlock);
        }

        if node.chunk.is_none() {
            if flags.contains(GetFlags::NONBLOCK) {
                return Err(Error::WouldBlock);
            }
            node.chunk = Some(Arc::new(self.storage.map(index)?));
        }

        if node.state == NodeState::Queued {
            // Re-pinned before its writeback ran; it re-queues on release.
            self.queue.retain(|&i| i != index);
            node.queued_at = None;
        }

        node.refs += 1;
        node.state = NodeState::Pinned;
        if writable {
            node.writers += 1;
        }

        if !flags.contains(GetFlags::DONT_LOG) {
            log::trace!("Pinned piece {} (refs {})", index, node.refs);
        }

        Ok(ChunkHandle { index, writable })
    }

    /// The mapped chunk behind a handle, shareable with the hash worker.
    pub fn chunk(&self, handle: &ChunkHandle) -> Arc<Chunk> {
        self.nodes[handle.index as usize]
            .chunk
            .clone()
            .expect("pinned node always has a mapping")
    }

    pub fn write(&mut self, handle: &ChunkHandle, offset: usize, data: &[u8]) -> Result<()> {
        if !handle.writable {
            return Err(Error::input("Write through a read-only handle"));
        }

        let node = &mut self.nodes[handle.index as usize];
        debug_assert!(node.refs > 0 && node.writers > 0);

        node.chunk
            .as_ref()
            .ok_or(Error::Internal("write on unmapped chunk"))?
            .write(offset, data)?;
        node.dirty = true;
        Ok(())
    }

    pub fn read(&self, handle: &ChunkHandle, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.nodes[handle.index as usize]
            .chunk
            .as_ref()
            .ok_or(Error::Internal("read on unmapped chunk"))?
            .read(offset, buf)
    }

    /// Zero a piece's bytes after a failed hash check.
    pub fn wipe(&mut self, handle: &ChunkHandle) -> Result<()> {
        if !handle.writable {
            return Err(Error::input("Wipe through a read-only handle"));
        }
        let node = &mut self.nodes[handle.index as usize];
        if let Some(chunk) = &node.chunk {
            chunk.clear();
            node.dirty = true;
        }
        Ok(())
    }

    /// Unpin. With `SYNC`, a dirty piece whose last pin just dropped is
    /// queued for writeback.
    pub fn release(&mut self, handle: ChunkHandle, flags: ReleaseFlags, now: Instant) {
        let node = &mut self.nodes[handle.index as usize];
        debug_assert!(node.refs > 0, "release without a pin");

        node.refs = node.refs.saturating_sub(1);
        if handle.writable {
            node.writers = node.writers.saturating_sub(1);
        }

        if node.refs > 0 {
            return;
        }

        if node.dirty && flags.contains(ReleaseFlags::SYNC) {
            node.state = NodeState::Queued;
            node.queued_at = Some(now);
            self.queue.push(handle.index);
        } else {
            node.state = NodeState::Inactive;
        }
    }

    /// Flush queued pieces. Returns the number of failed syncs.
    ///
    /// The queue is walked in piece order (which is file/offset order for a
    /// linear layout) so adjacent writeback coalesces; pieces far from the
    /// current run stay queued for the next pass unless `FORCE` or `ALL`.
    pub fn sync_chunks(&mut self, flags: SyncFlags, now: Instant) -> u32 {
        if flags.contains(SyncFlags::ALL) {
            for (i, node) in self.nodes.iter_mut().enumerate() {
                if node.dirty && node.refs == 0 && node.state != NodeState::Queued {
                    node.state = NodeState::Queued;
                    node.queued_at = Some(now);
                    self.queue.push(i as u32);
                }
            }
        }

        self.queue.sort_unstable();
        self.queue.dedup();

        let dont_skip = flags.intersects(SyncFlags::FORCE | SyncFlags::ALL);
        let blocking = !flags.contains(SyncFlags::SLOPPY) || flags.contains(SyncFlags::SAFE);

        let mut failures = 0;
        let mut kept = Vec::new();
        let mut prev: Option<u32> = None;

        for &index in &self.queue {
            let node = &mut self.nodes[index as usize];

            if node.refs > 0 || node.state != NodeState::Queued {
                continue;
            }

            if !dont_skip {
                if flags.contains(SyncFlags::USE_TIMEOUT) {
                    if let Some(at) = node.queued_at {
                        if now < at + SYNC_DELAY {
                            kept.push(index);
                            continue;
                        }
                    }
                }

                if let Some(p) = prev {
                    if index.saturating_sub(p) > MAX_SYNC_DISTANCE {
                        kept.push(index);
                        continue;
                    }
                }
            }

            node.state = NodeState::Syncing;
            let result = match &node.chunk {
                Some(chunk) => chunk.sync(blocking),
                None => Ok(()),
            };

            match result {
                Ok(()) => {
                    node.dirty = false;
                    node.queued_at = None;
                    node.state = NodeState::Inactive;
                    if flags.contains(SyncFlags::ALL) {
                        node.chunk = None;
                    }
                    prev = Some(index);
                }
                Err(e) => {
                    failures += 1;
                    node.read_only = true;
                    node.dirty = false;
                    node.queued_at = None;
                    node.state = NodeState::Inactive;

                    let msg = format!("Sync of piece {} failed: {}", index, e);
                    log::error!("{}", msg);
                    if !flags.contains(SyncFlags::IGNORE_ERROR) {
                        if let Some(cb) = &self.on_storage_error {
                            cb(&msg);
                        }
                    }
                }
            }
        }

        self.queue = kept;
        failures
    }

    /// Shrinking or growing the piece set is only legal while nothing is
    /// pinned.
    pub fn resize(&mut self, num_pieces: usize) -> Result<()> {
        if self.has_outstanding_handles() {
            return Err(Error::input(
                "Cannot resize the chunk list with outstanding handles",
            ));
        }
        self.nodes.resize_with(num_pieces, ChunkNode::new);
        self.queue.retain(|&i| (i as usize) < num_pieces);
        Ok(())
    }

    /// Drop every mapping. Callers first cancel hashing and wait for
    /// releases.
    pub fn clear(&mut self) {
        debug_assert!(!self.has_outstanding_handles());
        for node in &mut self.nodes {
            node.chunk = None;
            node.state = NodeState::Inactive;
            node.dirty = false;
            node.queued_at = None;
        }
        self.queue.clear();
    }

    pub fn storage(&self) -> &ChunkStorage {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;
    use crate::storage::file_pool::FilePool;
    use std::path::PathBuf;

    fn chunk_list(dir: &std::path::Path, total: u64, piece_len: u32) -> ChunkList {
        let files = [FileEntry {
            path: PathBuf::from("data.bin"),
            length: total,
        }];
        let storage = ChunkStorage::new(dir, &files, piece_len, Arc::new(FilePool::new(8)));
        ChunkList::new(storage)
    }

    #[test]
    fn pin_write_release_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = chunk_list(dir.path(), 32768, 16384);
        let now = Instant::now();

        let h = list.get(0, GetFlags::WRITABLE).unwrap();
        list.write(&h, 0, b"abcdef").unwrap();
        list.release(h, ReleaseFlags::SYNC, now);

        assert_eq!(list.queue_size(), 1);
        assert_eq!(list.sync_chunks(SyncFlags::empty(), now), 0);
        assert_eq!(list.queue_size(), 0);

        let on_disk = std::fs::read(dir.path().join("data.bin")).unwrap();
        assert_eq!(&on_disk[..6], b"abcdef");
    }

    #[test]
    fn repin_dequeues() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = chunk_list(dir.path(), 16384, 16384);
        let now = Instant::now();

        let h = list.get(0, GetFlags::WRITABLE).unwrap();
        list.write(&h, 0, b"x").unwrap();
        list.release(h, ReleaseFlags::SYNC, now);
        assert_eq!(list.queue_size(), 1);

        // Pinned again before the sync pass: nothing to sync now.
        let h = list.get(0, GetFlags::WRITABLE).unwrap();
        assert_eq!(list.queue_size(), 0);
        assert_eq!(list.sync_chunks(SyncFlags::empty(), now), 0);
        list.release(h, ReleaseFlags::SYNC, now);
        assert_eq!(list.queue_size(), 1);
    }

    #[test]
    fn refcounts_shared_pins() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = chunk_list(dir.path(), 16384, 16384);
        let now = Instant::now();

        let a = list.get(0, GetFlags::WRITABLE).unwrap();
        let b = list.get(0, GetFlags::empty()).unwrap();
        assert!(list.has_outstanding_handles());

        list.write(&a, 0, b"payload").unwrap();
        list.release(a, ReleaseFlags::SYNC, now);
        // Still pinned by the reader: not queued yet.
        assert_eq!(list.queue_size(), 0);

        list.release(b, ReleaseFlags::SYNC, now);
        assert_eq!(list.queue_size(), 1);
        assert!(!list.has_outstanding_handles());
    }

    #[test]
    fn read_only_handle_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = chunk_list(dir.path(), 16384, 16384);
        let now = Instant::now();

        let h = list.get(0, GetFlags::empty()).unwrap();
        assert!(list.write(&h, 0, b"x").is_err());
        list.release(h, ReleaseFlags::empty(), now);
    }

    #[test]
    fn use_timeout_defers_young_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = chunk_list(dir.path(), 16384, 16384);
        let now = Instant::now();

        let h = list.get(0, GetFlags::WRITABLE).unwrap();
        list.write(&h, 0, b"x").unwrap();
        list.release(h, ReleaseFlags::SYNC, now);

        // Too fresh to sync.
        assert_eq!(list.sync_chunks(SyncFlags::USE_TIMEOUT, now), 0);
        assert_eq!(list.queue_size(), 1);

        // Old enough now.
        let later = now + SYNC_DELAY;
        assert_eq!(list.sync_chunks(SyncFlags::USE_TIMEOUT, later), 0);
        assert_eq!(list.queue_size(), 0);

        // FORCE overrides the age check.
        let h = list.get(0, GetFlags::WRITABLE).unwrap();
        list.write(&h, 0, b"y").unwrap();
        list.release(h, ReleaseFlags::SYNC, later);
        assert_eq!(
            list.sync_chunks(SyncFlags::USE_TIMEOUT | SyncFlags::FORCE, later),
            0
        );
        assert_eq!(list.queue_size(), 0);
    }

    #[test]
    fn sync_all_unmaps() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = chunk_list(dir.path(), 32768, 16384);
        let now = Instant::now();

        let h = list.get(1, GetFlags::WRITABLE).unwrap();
        list.write(&h, 0, b"tail").unwrap();
        list.release(h, ReleaseFlags::empty(), now);

        // Dirty but unqueued; ALL picks it up and drops the mapping.
        assert_eq!(list.sync_chunks(SyncFlags::ALL, now), 0);
        assert!(list.nodes[1].chunk.is_none());
        assert!(!list.nodes[1].dirty);
    }

    #[test]
    fn resize_rejected_while_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = chunk_list(dir.path(), 32768, 16384);
        let now = Instant::now();

        let h = list.get(0, GetFlags::empty()).unwrap();
        assert!(list.resize(1).is_err());
        list.release(h, ReleaseFlags::empty(), now);
        assert!(list.resize(1).is_ok());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn wipe_zeroes_piece() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = chunk_list(dir.path(), 16384, 16384);
        let now = Instant::now();

        let h = list.get(0, GetFlags::WRITABLE).unwrap();
        list.write(&h, 100, b"junk").unwrap();
        list.wipe(&h).unwrap();

        let mut buf = [1u8; 8];
        list.read(&h, 100, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
        list.release(h, ReleaseFlags::empty(), now);
    }
}

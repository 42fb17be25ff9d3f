use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};
use crate::metainfo::FileEntry;
use crate::storage::file_pool::FilePool;

/// Paging advice forwarded per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Random,
    WillNeed,
    DontNeed,
}

/// One contiguous window of a piece, backed by a slice of a memory-mapped
/// file. The mapping starts at a page-aligned file offset; `trim` skips the
/// alignment slack at the front.
pub struct ChunkWindow {
    pub file_index: usize,
    /// Byte offset of the window within its file.
    pub file_offset: u64,
    /// Byte-accurate window length.
    pub len: usize,
    map: MmapMut,
    trim: usize,
    ptr: *mut u8,
    // Keeps the descriptor alive independent of the pool.
    _file: Arc<File>,
}

// The raw pointer aliases the mapping owned by this window; access is
// serialized by the chunk list's pin/sync state machine.
unsafe impl Send for ChunkWindow {}
unsafe impl Sync for ChunkWindow {}

impl ChunkWindow {
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Copy `data` into the window at `offset`.
    ///
    /// Caller (the chunk list) guarantees writer exclusivity; the window
    /// itself only checks bounds.
    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
    }

    pub fn advise(&self, advice: Advice) {
        #[cfg(unix)]
        {
            let flag = match advice {
                Advice::Normal => libc::MADV_NORMAL,
                Advice::Random => libc::MADV_RANDOM,
                Advice::WillNeed => libc::MADV_WILLNEED,
                Advice::DontNeed => libc::MADV_DONTNEED,
            };
            // Advice covers whole pages; start from the mapping base.
            unsafe {
                libc::madvise(
                    self.map.as_ptr() as *mut libc::c_void,
                    self.map.len(),
                    flag,
                );
            }
        }
        #[cfg(not(unix))]
        let _ = advice;
    }

    /// Largest resident prefix of the window starting at `offset`.
    #[cfg(unix)]
    pub fn incore_length(&self, offset: usize) -> usize {
        if offset >= self.len {
            return 0;
        }

        let page = page_size();
        // Window offset relative to the mapping base, rounded down to a
        // page.
        let base = (self.trim + offset) / page * page;
        let span = self.trim + self.len - base;
        let pages = (span + page - 1) / page;

        let mut vec = vec![0u8; pages];
        let rc = unsafe {
            libc::mincore(
                self.map.as_ptr().wrapping_add(base) as *mut libc::c_void,
                span,
                vec.as_mut_ptr() as *mut _,
            )
        };
        if rc != 0 {
            return 0;
        }

        let mut resident = 0usize;
        // Position of `offset` inside the first probed page.
        let pos = self.trim + offset - base;
        for (i, flags) in vec.iter().enumerate() {
            if flags & 1 == 0 {
                break;
            }
            let page_end = (i + 1) * page;
            resident = (page_end - pos).min(self.len - offset);
        }
        resident
    }

    #[cfg(not(unix))]
    pub fn incore_length(&self, offset: usize) -> usize {
        self.len.saturating_sub(offset)
    }

    /// msync the window's mapping.
    pub fn sync(&self, blocking: bool) -> io::Result<()> {
        if blocking {
            self.map.flush()
        } else {
            self.map.flush_async()
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A piece mapped into memory as a sequence of windows.
pub struct Chunk {
    pub index: u32,
    pub len: usize,
    windows: Vec<ChunkWindow>,
}

impl Chunk {
    pub fn windows(&self) -> &[ChunkWindow] {
        &self.windows
    }

    /// Resolve a byte offset within the piece to `(window, offset within
    /// window)`.
    pub fn find_window(&self, offset: usize) -> Option<(usize, usize)> {
        if offset >= self.len {
            return None;
        }
        let mut pos = 0;
        for (i, w) in self.windows.iter().enumerate() {
            if offset < pos + w.len {
                return Some((i, offset - pos));
            }
            pos += w.len;
        }
        None
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() > self.len {
            return Err(Error::input("Read outside the piece"));
        }
        if buf.is_empty() {
            return Ok(());
        }

        let (mut win, mut within) = self.find_window(offset).unwrap();
        let mut done = 0;
        while done < buf.len() {
            let w = &self.windows[win];
            let n = (w.len - within).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&w.bytes()[within..within + n]);
            done += n;
            win += 1;
            within = 0;
        }
        Ok(())
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.len {
            return Err(Error::input("Write outside the piece"));
        }
        if data.is_empty() {
            return Ok(());
        }

        let (mut win, mut within) = self.find_window(offset).unwrap();
        let mut done = 0;
        while done < data.len() {
            let w = &self.windows[win];
            let n = (w.len - within).min(data.len() - done);
            w.write_at(within, &data[done..done + n]);
            done += n;
            win += 1;
            within = 0;
        }
        Ok(())
    }

    /// Zero the piece contents (hash-mismatch wipe).
    pub(crate) fn clear(&self) {
        for w in &self.windows {
            unsafe { std::ptr::write_bytes(w.ptr, 0, w.len) }
        }
    }

    pub fn advise(&self, advice: Advice) {
        for w in &self.windows {
            w.advise(advice);
        }
    }

    /// Largest resident prefix of the piece from `offset`.
    pub fn incore_length(&self, offset: usize) -> usize {
        let mut total = 0;
        let mut pos = offset;
        while pos < self.len {
            let (win, within) = match self.find_window(pos) {
                Some(x) => x,
                None => break,
            };
            let n = self.windows[win].incore_length(within);
            total += n;
            if within + n < self.windows[win].len {
                break;
            }
            pos += n;
        }
        total
    }

    pub fn sync(&self, blocking: bool) -> io::Result<()> {
        for w in &self.windows {
            w.sync(blocking)?;
        }
        Ok(())
    }
}

/// Maps piece indexes onto mmapped windows over the torrent's file set.
pub struct ChunkStorage {
    files: Vec<(PathBuf, u64)>,
    piece_len: u32,
    length: u64,
    pool: Arc<FilePool>,
}

impl ChunkStorage {
    pub fn new(
        root: &std::path::Path,
        files: &[FileEntry],
        piece_len: u32,
        pool: Arc<FilePool>,
    ) -> Self {
        let files = files
            .iter()
            .map(|f| (root.join(&f.path), f.length))
            .collect::<Vec<_>>();
        let length = files.iter().map(|(_, len)| len).sum();

        Self {
            files,
            piece_len,
            length,
            pool,
        }
    }

    pub fn files(&self) -> &[(PathBuf, u64)] {
        &self.files
    }

    pub fn piece_len_at(&self, index: u32) -> usize {
        let start = index as u64 * self.piece_len as u64;
        (self.length - start).min(self.piece_len as u64) as usize
    }

    pub fn num_pieces(&self) -> u32 {
        ((self.length + self.piece_len as u64 - 1) / self.piece_len as u64) as u32
    }

    /// Map the piece: one window per intersected file, page-aligned with
    /// byte-accurate trim.
    pub fn map(&self, index: u32) -> Result<Chunk> {
        let start = index as u64 * self.piece_len as u64;
        if start >= self.length {
            return Err(Error::input(format!("Piece {} out of range", index)));
        }
        let end = (start + self.piece_len as u64).min(self.length);

        let mut windows = Vec::new();
        let mut file_start = 0u64;

        for (file_index, (path, file_len)) in self.files.iter().enumerate() {
            let file_end = file_start + file_len;

            if file_end > start && file_start < end {
                let lo = start.max(file_start) - file_start;
                let hi = end.min(file_end) - file_start;

                let file = self.pool.open(path, *file_len).map_err(|e| {
                    Error::Storage(format!("{}: {}", path.display(), e))
                })?;

                windows.push(map_window(file, file_index, lo, (hi - lo) as usize)?);
            }

            file_start = file_end;
            if file_start >= end {
                break;
            }
        }

        Ok(Chunk {
            index,
            len: (end - start) as usize,
            windows,
        })
    }
}

fn map_window(
    file: Arc<File>,
    file_index: usize,
    file_offset: u64,
    len: usize,
) -> Result<ChunkWindow> {
    #[cfg(unix)]
    let page = page_size() as u64;
    #[cfg(not(unix))]
    let page = 4096u64;

    let aligned = file_offset / page * page;
    let trim = (file_offset - aligned) as usize;

    let mut map = unsafe {
        MmapOptions::new()
            .offset(aligned)
            .len(trim + len)
            .map_mut(&*file)
            .map_err(|e| Error::Storage(format!("mmap failed: {}", e)))?
    };

    let ptr = unsafe { map.as_mut_ptr().add(trim) };

    Ok(ChunkWindow {
        file_index,
        file_offset,
        len,
        map,
        trim,
        ptr,
        _file: file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &std::path::Path, files: &[(&str, u64)], piece_len: u32) -> ChunkStorage {
        let entries: Vec<FileEntry> = files
            .iter()
            .map(|(name, len)| FileEntry {
                path: PathBuf::from(name),
                length: *len,
            })
            .collect();
        ChunkStorage::new(dir, &entries, piece_len, Arc::new(FilePool::new(8)))
    }

    #[test]
    fn single_file_single_window() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path(), &[("a.bin", 32768)], 16384);

        let chunk = s.map(1).unwrap();
        assert_eq!(chunk.len, 16384);
        assert_eq!(chunk.windows().len(), 1);
        assert_eq!(chunk.windows()[0].file_offset, 16384);

        chunk.write(0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        chunk.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn piece_spanning_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        // 10 KiB + 10 KiB with 16 KiB pieces: piece 0 crosses the boundary.
        let s = storage(dir.path(), &[("a.bin", 10240), ("b.bin", 10240)], 16384);
        assert_eq!(s.num_pieces(), 2);

        let chunk = s.map(0).unwrap();
        assert_eq!(chunk.len, 16384);
        assert_eq!(chunk.windows().len(), 2);
        assert_eq!(chunk.windows()[0].len, 10240);
        assert_eq!(chunk.windows()[1].len, 6144);
        assert_eq!(chunk.windows()[1].file_offset, 0);

        // Offset resolution across the seam.
        assert_eq!(chunk.find_window(0), Some((0, 0)));
        assert_eq!(chunk.find_window(10239), Some((0, 10239)));
        assert_eq!(chunk.find_window(10240), Some((1, 0)));
        assert_eq!(chunk.find_window(16384), None);

        // A write across the seam reads back whole, and the concatenated
        // window bytes equal the piece bytes.
        let data: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        chunk.write(0, &data).unwrap();

        let mut read_back = vec![0u8; 16384];
        chunk.read(0, &mut read_back).unwrap();
        assert_eq!(read_back, data);

        let joined: Vec<u8> = chunk
            .windows()
            .iter()
            .flat_map(|w| w.bytes().to_vec())
            .collect();
        assert_eq!(joined, data);

        // The tail piece only covers what remains.
        let tail = s.map(1).unwrap();
        assert_eq!(tail.len, 4096);
        assert_eq!(tail.windows().len(), 1);
        assert_eq!(tail.windows()[0].file_offset, 6144);
    }

    #[test]
    fn writes_reach_the_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path(), &[("a.bin", 8), ("b.bin", 8)], 16);

        let chunk = s.map(0).unwrap();
        chunk.write(0, b"0123456789abcdef").unwrap();
        chunk.sync(true).unwrap();
        drop(chunk);

        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"01234567");
        assert_eq!(std::fs::read(dir.path().join("b.bin")).unwrap(), b"89abcdef");
    }

    #[test]
    fn bounds_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path(), &[("a.bin", 1024)], 1024);

        let chunk = s.map(0).unwrap();
        assert!(chunk.write(1020, b"abcde").is_err());
        let mut buf = [0u8; 8];
        assert!(chunk.read(1020, &mut buf).is_err());
        assert!(s.map(1).is_err());

        chunk.advise(Advice::Random);
        chunk.advise(Advice::WillNeed);
    }

    #[cfg(unix)]
    #[test]
    fn incore_after_touch() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path(), &[("a.bin", 65536)], 65536);

        let chunk = s.map(0).unwrap();
        chunk.write(0, &[7u8; 65536]).unwrap();

        // Freshly written pages are resident.
        assert_eq!(chunk.incore_length(0), 65536);
        assert_eq!(chunk.incore_length(65536), 0);
    }
}

//! Piece storage: memory-mapped windows over the file set, pin-counted
//! chunk nodes with ordered writeback, and the bounded open-file pool.

mod chunk;
mod chunk_list;
mod file_pool;

pub use chunk::{Advice, Chunk, ChunkStorage, ChunkWindow};
pub use chunk_list::{ChunkHandle, ChunkList, GetFlags, ReleaseFlags, SyncFlags};
pub use file_pool::{FilePool, MIN_OPEN_FILES};

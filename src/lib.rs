//! ebbtide: a BitTorrent engine.
//!
//! The engine turns torrent descriptors into verified on-disk data: it
//! schedules peers and pieces, speaks the peer wire protocol (plain and
//! MSE), stores pieces through memory-mapped windows with ordered
//! writeback, hashes on a worker thread, and discovers peers over the
//! mainline DHT. Trackers, front-ends and configuration loading live
//! outside this crate.
//!
//! Entry point: [`session::Session`] binds the listener and the DHT, then
//! [`session::Session::add_torrent`] starts per-torrent engines driven by
//! their own tasks.

pub mod config;
pub mod delegator;
pub mod dht;
pub mod hash;
pub mod metainfo;
pub mod peer;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod throttle;
pub mod torrent;

mod error;

pub use config::{Config, DhtMode, EncryptionPolicy};
pub use error::{Error, Result};
pub use metainfo::{InfoHash, Metainfo};
pub use session::Session;
pub use torrent::{TorrentHandle, TorrentStatus};

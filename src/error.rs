use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error kinds.
///
/// `Io` failures on retryable paths are handled silently by the owning
/// loop; `Storage` surfaces a human-readable message through the
/// storage-error callback and leaves the torrent running read-only;
/// `Protocol` closes the offending peer; `HashMismatch` triggers
/// re-download and penalties; `Input` is rejected at the API boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Hash mismatch on piece {0}")]
    HashMismatch(u32),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Operation would block")]
    WouldBlock,

    #[error("Connection closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        Error::Input(msg.into())
    }

    /// True for failures the owning loop retries without surfacing.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::WouldBlock => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<peer_proto::handshake::Error> for Error {
    fn from(e: peer_proto::handshake::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<bencode::Error> for Error {
    fn from(e: bencode::Error) -> Self {
        Error::Input(e.to_string())
    }
}

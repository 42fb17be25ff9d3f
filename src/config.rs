use std::ops::RangeInclusive;

/// Transport-encryption policy for peer connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPolicy {
    /// Plaintext only.
    Disabled,
    /// Plaintext outgoing; encrypted incoming accepted.
    AllowIncoming,
    /// Try encrypted first, fall back to plaintext.
    Prefer,
    /// Encrypted only.
    Require,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtMode {
    Off,
    /// On when the torrent does not forbid it.
    Auto,
    On,
}

/// Engine-wide settings. Loading these from disk or flags is the
/// front-end's business; the engine only consumes the struct.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_ports: RangeInclusive<u16>,
    pub max_peers: usize,
    pub max_peers_per_host: usize,
    pub max_open_files: usize,
    pub encryption: EncryptionPolicy,
    pub dht: DhtMode,
    /// Bytes per second; 0 means unlimited.
    pub download_rate: u32,
    /// Bytes per second; 0 means unlimited.
    pub upload_rate: u32,
    /// Max pipelined requests per peer (`reqq`).
    pub max_peer_requests: usize,
    /// Duplicate-request endgame mode.
    pub aggressive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_ports: 6881..=6889,
            max_peers: 100,
            max_peers_per_host: 2,
            max_open_files: 128,
            encryption: EncryptionPolicy::AllowIncoming,
            dht: DhtMode::Auto,
            download_rate: 0,
            upload_rate: 0,
            max_peer_requests: 500,
            aggressive: true,
        }
    }
}

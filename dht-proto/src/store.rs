use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::id::NodeId;

const PEER_EXPIRY: Duration = Duration::from_secs(30 * 60);
const MAX_PEERS_PER_HASH: usize = 128;

/// Peers announced to us, per info-hash, with a 30-minute lifetime.
#[derive(Default)]
pub struct PeerStore {
    peers: HashMap<NodeId, Vec<(SocketAddr, Instant)>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info_hash: NodeId, addr: SocketAddr, now: Instant) {
        let entries = self.peers.entry(info_hash).or_default();

        if let Some(e) = entries.iter_mut().find(|(a, _)| *a == addr) {
            e.1 = now;
            return;
        }

        if entries.len() >= MAX_PEERS_PER_HASH {
            // Replace the oldest entry.
            if let Some(oldest) = entries.iter_mut().min_by_key(|(_, t)| *t) {
                *oldest = (addr, now);
            }
            return;
        }

        entries.push((addr, now));
    }

    pub fn get(&self, info_hash: &NodeId, now: Instant) -> Vec<SocketAddr> {
        match self.peers.get(info_hash) {
            Some(entries) => entries
                .iter()
                .filter(|(_, t)| now.duration_since(*t) < PEER_EXPIRY)
                .map(|(a, _)| *a)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop entries older than the expiry window. Driven from the
    /// maintenance tick.
    pub fn expire(&mut self, now: Instant) {
        self.peers.retain(|_, entries| {
            entries.retain(|(_, t)| now.duration_since(*t) < PEER_EXPIRY);
            !entries.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.peers.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

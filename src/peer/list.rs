use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use rand::Rng;
use slab::Slab;

use crate::delegator::PeerKey;
use crate::peer::PeerId;

/// Soft cap of the dialing candidate list.
const AVAILABLE_SOFT_CAP: usize = 1000;

/// Idle peers older than this are culled.
const CULL_AGE: Duration = Duration::from_secs(60 * 60);

bitflags::bitflags! {
    pub struct InsertFlags: u32 {
        /// Also queue the address for dialing.
        const AVAILABLE = 1 << 0;
    }
}

bitflags::bitflags! {
    pub struct DisconnectFlags: u32 {
        /// Put the address back on the dialing list.
        const AVAILABLE = 1 << 0;
        /// Stamp the disconnect time.
        const SET_TIME = 1 << 1;
    }
}

bitflags::bitflags! {
    pub struct CullFlags: u32 {
        const OLD = 1 << 0;
        /// Spare peers that ever sent us payload.
        const KEEP_INTERESTING = 1 << 1;
    }
}

/// Normalized address key: family + address bytes + port. V6 scope and
/// flow info do not participate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrKey {
    ip: IpAddr,
    port: u16,
}

impl From<SocketAddr> for AddrKey {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

/// Stable identity of a peer across connections.
#[derive(Debug)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
    pub listen_port: Option<u16>,
    pub last_connection: Option<Instant>,
    pub failures: u32,
    pub connected: bool,
    /// Ever sent us payload bytes.
    pub transferred: bool,
    pub banned: bool,
}

impl PeerInfo {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
            listen_port: None,
            last_connection: None,
            failures: 0,
            connected: false,
            transferred: false,
            banned: false,
        }
    }
}

/// Candidate addresses for dialing.
#[derive(Default)]
pub struct AvailableList {
    addrs: Vec<SocketAddr>,
}

impl AvailableList {
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn want_more(&self) -> bool {
        self.addrs.len() < AVAILABLE_SOFT_CAP
    }

    pub fn push_back_unique(&mut self, addr: SocketAddr) -> bool {
        if self.addrs.contains(&addr) {
            return false;
        }
        self.addrs.push(addr);
        true
    }

    pub fn pop_random(&mut self) -> Option<SocketAddr> {
        if self.addrs.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..self.addrs.len());
        Some(self.addrs.swap_remove(i))
    }
}

/// Candidate pool keyed by normalized address.
///
/// Peer infos live in an arena; everything else refers to them by key.
pub struct PeerList {
    arena: Slab<PeerInfo>,
    by_addr: HashMap<AddrKey, PeerKey>,
    available: AvailableList,
    max_per_host: usize,
}

impl PeerList {
    pub fn new(max_per_host: usize) -> Self {
        Self {
            arena: Slab::new(),
            by_addr: HashMap::new(),
            available: AvailableList::default(),
            max_per_host: max_per_host.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, key: PeerKey) -> Option<&PeerInfo> {
        self.arena.get(key)
    }

    pub fn get_mut(&mut self, key: PeerKey) -> Option<&mut PeerInfo> {
        self.arena.get_mut(key)
    }

    pub fn available(&mut self) -> &mut AvailableList {
        &mut self.available
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerKey, &PeerInfo)> {
        self.arena.iter()
    }

    /// Adopt or refresh an address sighting.
    pub fn insert_address(&mut self, addr: SocketAddr, flags: InsertFlags) -> PeerKey {
        let key = match self.by_addr.get(&AddrKey::from(addr)) {
            Some(&key) => key,
            None => {
                let key = self.arena.insert(PeerInfo::new(addr));
                self.by_addr.insert(AddrKey::from(addr), key);
                key
            }
        };

        if flags.contains(InsertFlags::AVAILABLE) && !self.arena[key].connected {
            self.available.push_back_unique(addr);
        }
        key
    }

    /// Claim a peer info for a new connection, or `None` when the per-host
    /// cap is reached or the peer is banned.
    pub fn connected(&mut self, addr: SocketAddr) -> Option<PeerKey> {
        let host_connections = self
            .arena
            .iter()
            .filter(|(_, p)| p.connected && p.addr.ip() == addr.ip())
            .count();
        if host_connections >= self.max_per_host {
            log::debug!("Connection cap reached for {}", addr.ip());
            return None;
        }

        let key = self.insert_address(addr, InsertFlags::empty());
        let info = &mut self.arena[key];
        if info.banned || info.connected {
            return None;
        }

        info.connected = true;
        Some(key)
    }

    pub fn disconnected(&mut self, key: PeerKey, flags: DisconnectFlags, now: Instant) {
        let info = match self.arena.get_mut(key) {
            Some(i) => i,
            None => return,
        };

        info.connected = false;
        if flags.contains(DisconnectFlags::SET_TIME) {
            info.last_connection = Some(now);
        }
        if flags.contains(DisconnectFlags::AVAILABLE) && !info.banned {
            self.available.push_back_unique(info.addr);
        }
    }

    /// Drop stale candidates. Returns the number culled.
    pub fn cull(&mut self, flags: CullFlags, now: Instant) -> usize {
        if !flags.contains(CullFlags::OLD) {
            return 0;
        }

        let keep_interesting = flags.contains(CullFlags::KEEP_INTERESTING);
        let mut victims = Vec::new();

        for (key, info) in self.arena.iter() {
            if info.connected {
                continue;
            }
            if keep_interesting && info.transferred {
                continue;
            }
            let stale = match info.last_connection {
                Some(t) => now.duration_since(t) >= CULL_AGE,
                None => false,
            };
            if stale {
                victims.push((key, AddrKey::from(info.addr)));
            }
        }

        for (key, addr_key) in &victims {
            self.arena.remove(*key);
            self.by_addr.remove(addr_key);
        }
        victims.len()
    }
}

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::cache::NodeCache;
use crate::contact::Contact;
use crate::id::NodeId;
use crate::msg::recv::Msg;
use crate::store::PeerStore;
use crate::table::RoutingTable;
use crate::token::TokenStore;

mod rpc;
mod task;

use self::task::{AnnounceTask, BootstrapTask, GetPeersTask, PingTask, Task};

pub use self::rpc::Event;
pub use self::task::TaskId;

const TXN_PRUNE_EVERY: Duration = Duration::from_secs(1);
const REFRESH_CHECK_EVERY: Duration = Duration::from_secs(60);
const MAINTENANCE_EVERY: Duration = Duration::from_secs(15 * 60);
const BOOTSTRAP_RETRY: Duration = Duration::from_secs(60);

/// Keep bootstrapping until the table holds this many contacts.
const WANT_CONTACTS: usize = 256;
const MAX_BOOTSTRAP_CANDIDATES: usize = 1024;

/// Operations the engine can ask of the DHT.
pub enum ClientRequest {
    Announce {
        info_hash: NodeId,
        port: u16,
        implied_port: bool,
    },
    GetPeers {
        info_hash: NodeId,
    },
    Ping {
        id: NodeId,
        addr: SocketAddr,
    },
    Bootstrap {
        target: NodeId,
    },
}

/// The sans-io DHT node.
///
/// The driver loop calls [`receive`](Dht::receive) for every datagram,
/// [`tick`](Dht::tick) at least once a second, and drains
/// [`poll_event`](Dht::poll_event) after both.
pub struct Dht {
    table: RoutingTable,
    tasks: Slab<Box<dyn Task>>,
    rpc: rpc::RpcManager,
    tokens: TokenStore,
    peers: PeerStore,
    next_txn_prune: Instant,
    next_refresh_check: Instant,
    next_maintenance: Instant,
    next_bootstrap: Instant,
}

impl Dht {
    pub fn new(own_id: NodeId, router_nodes: Vec<SocketAddr>, now: Instant) -> Self {
        Self {
            table: RoutingTable::new(own_id, router_nodes, now),
            tasks: Slab::new(),
            rpc: rpc::RpcManager::new(own_id),
            tokens: TokenStore::new(now),
            peers: PeerStore::new(),
            next_txn_prune: now + TXN_PRUNE_EVERY,
            next_refresh_check: now + REFRESH_CHECK_EVERY,
            next_maintenance: now + MAINTENANCE_EVERY,
            next_bootstrap: now,
        }
    }

    /// Restore from a persisted cache: reuse the node id and seed the table
    /// with the remembered contacts.
    pub fn from_cache(cache: &NodeCache, router_nodes: Vec<SocketAddr>, now: Instant) -> Self {
        let mut dht = Self::new(cache.own_id, router_nodes, now);
        for (id, addr) in &cache.nodes {
            dht.table.add_contact(Contact::new(*id, *addr), now);
        }
        dht
    }

    /// Snapshot for persistence: contacts still worth re-dialing.
    pub fn cache(&self, now: Instant) -> NodeCache {
        let mut out = Vec::new();
        let target = self.table.own_id;
        let mut closest = Vec::new();
        self.table.find_closest(&target, &mut closest, usize::MAX, now);
        for c in closest {
            out.push((c.id, c.addr));
        }
        NodeCache {
            own_id: self.table.own_id,
            nodes: out,
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.table.own_id
    }

    pub fn num_contacts(&self) -> usize {
        self.table.len()
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.rpc.events.pop_front()
    }

    /// The deadline of the nearest timer, for the driver's sleep.
    pub fn next_timeout(&self) -> Instant {
        let mut next = self.next_txn_prune.min(self.next_refresh_check);
        next = next.min(self.next_maintenance).min(self.next_bootstrap);
        if let Some(t) = self.rpc.next_timeout() {
            next = next.min(t);
        }
        next
    }

    /// Add a bootstrap candidate address (a router or a cached node without
    /// a verified id).
    pub fn add_bootstrap_candidate(&mut self, addr: SocketAddr) {
        if self.table.num_routers() < MAX_BOOTSTRAP_CANDIDATES {
            self.table.add_router(addr);
        }
    }

    pub fn tick(&mut self, now: Instant) {
        if now >= self.next_txn_prune {
            self.rpc.check_timeouts(&mut self.table, &mut self.tasks, now);
            self.next_txn_prune = now + TXN_PRUNE_EVERY;
        }

        if now >= self.next_refresh_check {
            self.tokens.maybe_rotate(now);
            if let Some(refresh) = self.table.next_refresh(now) {
                log::trace!("Routing table refresh due");
                self.add_request(refresh, now);
            }
            self.next_refresh_check = now + REFRESH_CHECK_EVERY;
        }

        if now >= self.next_maintenance {
            self.table.expire_stale(now);
            self.peers.expire(now);
            self.next_maintenance = now + MAINTENANCE_EVERY;
        }

        if now >= self.next_bootstrap {
            if self.table.len() < WANT_CONTACTS && self.table.num_routers() > 0 {
                log::debug!(
                    "Bootstrapping, {} contacts so far",
                    self.table.len()
                );
                let target = self.table.own_id;
                self.add_request(ClientRequest::Bootstrap { target }, now);
            }
            self.next_bootstrap = now + BOOTSTRAP_RETRY;
        }
    }

    pub fn add_request(&mut self, request: ClientRequest, now: Instant) -> Option<TaskId> {
        use ClientRequest::*;

        let entry = self.tasks.vacant_entry();
        let tid = TaskId(entry.key());
        let table = &self.table;

        let mut task: Box<dyn Task> = match request {
            GetPeers { info_hash } => Box::new(GetPeersTask::new(&info_hash, table, tid, now)),
            Bootstrap { target } => Box::new(BootstrapTask::new(&target, table, tid, now)),
            Announce {
                info_hash,
                port,
                implied_port,
            } => Box::new(AnnounceTask::new(
                &info_hash,
                table,
                tid,
                port,
                implied_port,
                now,
            )),
            Ping { id, addr } => Box::new(PingTask::new(&id, &addr, tid)),
        };

        let done = task.add_requests(&mut self.rpc, now);
        if done {
            task.done(&mut self.rpc, now);
            None
        } else {
            entry.insert(task);
            Some(tid)
        }
    }

    pub fn receive(&mut self, buf: &[u8], addr: SocketAddr, now: Instant) {
        log::trace!("Got {} bytes from {}", buf.len(), addr);

        let msg = match Msg::parse(buf) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Error parsing message from {}: {}", addr, e);
                return;
            }
        };

        self.rpc.handle_msg(
            msg,
            addr,
            &mut self.table,
            &mut self.tasks,
            &mut self.tokens,
            &mut self.peers,
            now,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_transmits(dht: &mut Dht) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut out = vec![];
        while let Some(ev) = dht.poll_event() {
            match ev {
                Event::Transmit { data, target, .. } | Event::Reply { data, target } => {
                    out.push((data, target))
                }
                _ => {}
            }
        }
        out
    }

    /// Two in-memory DHT nodes exchanging datagrams directly.
    #[test]
    fn ping_pong_marks_node_good() {
        let now = Instant::now();
        let addr_a: SocketAddr = ([127, 0, 0, 1], 7001).into();
        let addr_b: SocketAddr = ([127, 0, 0, 1], 7002).into();

        let mut a = Dht::new(NodeId::all(1), vec![], now);
        let mut b = Dht::new(NodeId::all(0x80), vec![], now);

        a.add_request(
            ClientRequest::Ping {
                id: b.own_id(),
                addr: addr_b,
            },
            now,
        );

        // A -> B: ping.
        let out = drain_transmits(&mut a);
        assert_eq!(out.len(), 1);
        b.receive(&out[0].0, addr_a, now);

        // B -> A: pong, B learned A as a contact.
        let out = drain_transmits(&mut b);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, addr_a);
        a.receive(&out[0].0, addr_b, now);

        assert!(a.is_idle());
        let c = a.table.find_contact(&NodeId::all(0x80)).unwrap();
        assert!(c.is_confirmed());
        assert_eq!(c.liveness(now), crate::contact::Liveness::Good);

        // B inserted A by the distance of their ids.
        let idx = NodeId::all(0x80).xor_leading_zeros(&NodeId::all(1));
        assert_eq!(b.table.bucket(idx).live.len(), 1);
    }

    #[test]
    fn get_peers_returns_token_and_announce_stores_peer() {
        let now = Instant::now();
        let addr_a: SocketAddr = ([127, 0, 0, 1], 7001).into();
        let addr_b: SocketAddr = ([127, 0, 0, 1], 7002).into();

        let mut a = Dht::new(NodeId::all(1), vec![], now);
        let mut b = Dht::new(NodeId::all(2), vec![], now);

        // Teach A about B.
        a.table.add_contact(Contact::new(b.own_id(), addr_b), now);

        let info_hash = NodeId::all(9);
        a.add_request(
            ClientRequest::Announce {
                info_hash,
                port: 6881,
                implied_port: false,
            },
            now,
        );

        // A -> B: get_peers.
        let out = drain_transmits(&mut a);
        assert_eq!(out.len(), 1);
        b.receive(&out[0].0, addr_a, now);

        // B -> A: nodes + token.
        let out = drain_transmits(&mut b);
        assert_eq!(out.len(), 1);
        a.receive(&out[0].0, addr_b, now);

        // Traversal exhausted; A announces to B with B's token.
        let out = drain_transmits(&mut a);
        assert_eq!(out.len(), 1);
        b.receive(&out[0].0, addr_a, now);

        let mut expected: SocketAddr = addr_a;
        expected.set_port(6881);
        assert_eq!(b.peers.get(&info_hash, now), vec![expected]);

        // Consume B's acknowledgement so it does not interleave below.
        let acks = drain_transmits(&mut b);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].1, addr_a);

        // The stored peer is served to the next get_peers.
        let mut c = Dht::new(NodeId::all(3), vec![], now);
        let addr_c: SocketAddr = ([127, 0, 0, 1], 7003).into();
        c.table.add_contact(Contact::new(b.own_id(), addr_b), now);
        c.add_request(ClientRequest::GetPeers { info_hash }, now);

        let out = drain_transmits(&mut c);
        b.receive(&out[0].0, addr_c, now);
        let out = drain_transmits(&mut b);
        c.receive(&out[0].0, addr_b, now);

        // B also referred C to A, which never answers; let that query
        // expire so the traversal settles.
        let later = now + Duration::from_secs(6);
        c.tick(later);

        let mut found = vec![];
        while let Some(ev) = c.poll_event() {
            if let Event::FoundPeers { peers, .. } = ev {
                found.extend(peers);
            }
        }
        assert_eq!(found, vec![expected]);
    }

    #[test]
    fn bad_announce_token_rejected() {
        let now = Instant::now();
        let addr_a: SocketAddr = ([127, 0, 0, 1], 7001).into();

        let mut b = Dht::new(NodeId::all(2), vec![], now);

        // announce_peer with a made-up token.
        let mut buf = Vec::new();
        let mut d = bencode::DictEncoder::new(&mut buf);
        let mut args = d.insert_dict("a");
        args.insert("id", &NodeId::all(1));
        args.insert("info_hash", &NodeId::all(9));
        args.insert("port", 6881i64);
        args.insert("token", &b"deadbeef"[..]);
        args.finish();
        d.insert("q", "announce_peer");
        d.insert("t", &b"zz"[..]);
        d.insert("y", "q");
        d.finish();

        b.receive(&buf, addr_a, now);

        // An error reply goes out and nothing is stored.
        let out = drain_transmits(&mut b);
        assert_eq!(out.len(), 1);
        assert!(out[0].0.windows(7).any(|w| w == b"1:y1:ee"));
        assert!(b.peers.is_empty());
    }

    #[test]
    fn wrong_id_reply_invalidates_node() {
        let now = Instant::now();
        let addr_b: SocketAddr = ([127, 0, 0, 1], 7002).into();

        let mut a = Dht::new(NodeId::all(1), vec![], now);
        let real_id = NodeId::all(0x40);
        a.table.add_contact(Contact::new(real_id, addr_b), now);

        a.add_request(
            ClientRequest::Ping {
                id: real_id,
                addr: addr_b,
            },
            now,
        );
        let out = drain_transmits(&mut a);
        assert_eq!(out.len(), 1);

        // Craft a reply with the right txn but a different id.
        let msg = Msg::parse(&out[0].0).unwrap();
        let txn = match msg {
            Msg::Query(q) => q.txn.to_vec(),
            _ => panic!("expected query"),
        };

        let mut buf = Vec::new();
        let mut d = bencode::DictEncoder::new(&mut buf);
        let mut r = d.insert_dict("r");
        r.insert("id", &NodeId::all(0x41));
        r.finish();
        d.insert("t", txn);
        d.insert("y", "r");
        d.finish();

        a.receive(&buf, addr_b, now);

        let c = a.table.find_contact(&real_id).unwrap();
        assert!(c.is_bad());
    }

    #[test]
    fn bootstrap_retries_until_populated() {
        let now = Instant::now();
        let router: SocketAddr = ([10, 0, 0, 9], 6881).into();
        let mut dht = Dht::new(NodeId::all(1), vec![router], now);

        dht.tick(now);
        let out = drain_transmits(&mut dht);
        assert_eq!(out.len(), 1, "bootstrap find_node should go to the router");
        assert_eq!(out[0].1, router);

        // Not due again until the retry interval passes.
        dht.tick(now + Duration::from_secs(1));
        assert!(drain_transmits(&mut dht).is_empty());
    }

    #[test]
    fn cache_roundtrip_preserves_contacts() {
        let now = Instant::now();
        let mut dht = Dht::new(NodeId::all(1), vec![], now);
        dht.table
            .add_contact(Contact::new(NodeId::all(2), ([10, 0, 0, 2], 1).into()), now);

        let cache = dht.cache(now);
        assert_eq!(cache.own_id, NodeId::all(1));
        assert_eq!(cache.nodes.len(), 1);

        let restored = Dht::from_cache(&cache, vec![], now);
        assert_eq!(restored.own_id(), NodeId::all(1));
        assert_eq!(restored.num_contacts(), 1);
    }
}

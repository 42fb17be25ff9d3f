use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::bucket::Bucket;
use crate::contact::{Contact, Liveness};
use crate::id::NodeId;
use crate::server::ClientRequest;

const BUCKETS: usize = 160;

const BUCKET_REFRESH: Duration = Duration::from_secs(15 * 60);
const NODE_EXPIRY: Duration = Duration::from_secs(4 * 60 * 60);

/// Kademlia routing table.
///
/// Bucket `i` covers all ids whose XOR distance from our own id has exactly
/// `i` leading zero bits; the buckets therefore partition the id space and
/// the one-per-prefix layout stands in for explicit bucket splitting.
#[derive(Debug)]
pub struct RoutingTable {
    pub own_id: NodeId,
    buckets: Vec<Bucket>,
    refresh_at: Vec<Instant>,
    router_nodes: HashSet<SocketAddr>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId, router_nodes: Vec<SocketAddr>, now: Instant) -> Self {
        Self {
            own_id,
            buckets: vec![Bucket::new(); BUCKETS],
            refresh_at: vec![now + BUCKET_REFRESH; BUCKETS],
            router_nodes: router_nodes.into_iter().collect(),
        }
    }

    pub fn is_router(&self, addr: &SocketAddr) -> bool {
        self.router_nodes.contains(addr)
    }

    pub fn add_router(&mut self, addr: SocketAddr) -> bool {
        self.router_nodes.insert(addr)
    }

    pub fn num_routers(&self) -> usize {
        self.router_nodes.len()
    }

    pub fn router_nodes(&self) -> impl Iterator<Item = &SocketAddr> {
        self.router_nodes.iter()
    }

    /// Live contact count.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.live.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.live.is_empty())
    }

    pub fn len_extra(&self) -> usize {
        self.buckets.iter().map(|b| b.extra.len()).sum()
    }

    #[cfg(test)]
    pub fn bucket(&self, idx: usize) -> &Bucket {
        &self.buckets[idx]
    }

    /// The next bucket due for a refresh, as a client request: ping the
    /// questionable head of a full bucket, otherwise look up a random id
    /// in the bucket's range.
    pub fn next_refresh(&mut self, now: Instant) -> Option<ClientRequest> {
        let idx = self.refresh_at.iter().position(|t| now >= *t)?;
        log::trace!("Refresh bucket: {}", idx);

        self.refresh_at[idx] = now + BUCKET_REFRESH;
        let bucket = &self.buckets[idx];

        if bucket.is_full() {
            let c = bucket.questionable_head(now).or_else(|| {
                // Everyone is good (or bad); probe the shakiest.
                bucket
                    .live
                    .iter()
                    .chain(bucket.extra.iter())
                    .max_by_key(|c| c.fail_count())
            })?;

            Some(ClientRequest::Ping {
                id: c.id,
                addr: c.addr,
            })
        } else {
            let target = NodeId::gen_at_distance(&self.own_id, idx);
            Some(ClientRequest::Bootstrap { target })
        }
    }

    /// Drop bad nodes and nodes silent for longer than the expiry window.
    pub fn expire_stale(&mut self, now: Instant) {
        for bucket in &mut self.buckets {
            bucket.live.retain(|c| {
                if c.liveness(now) == Liveness::Bad {
                    return false;
                }
                match c.last_replied() {
                    Some(t) => now.duration_since(t) < NODE_EXPIRY,
                    None => true,
                }
            });
            bucket.extra.retain(|c| c.liveness(now) != Liveness::Bad);
        }
    }

    pub fn add_contact(&mut self, mut contact: Contact, now: Instant) -> bool {
        if self.router_nodes.contains(&contact.addr) {
            return false;
        }

        if self.own_id == contact.id {
            return false;
        }

        let idx = self.idx_of(&contact.id);
        let bucket = &mut self.buckets[idx];

        if let Some(c) = bucket.live.iter_mut().find(|c| c.id == contact.id) {
            if c.addr != contact.addr {
                return false;
            }
            c.set_confirmed(now);
            self.refresh_at[idx] = now + BUCKET_REFRESH;
            return true;
        }

        let maybe_extra = bucket
            .extra
            .iter_mut()
            .enumerate()
            .find(|(_, c)| c.id == contact.id);

        if let Some((i, c)) = maybe_extra {
            if c.addr != contact.addr {
                return false;
            }
            c.set_confirmed(now);
            contact = bucket.extra.remove(i);
        }

        if bucket.live.len() < Bucket::MAX_LEN {
            bucket.live.push(contact);
            self.refresh_at[idx] = now + BUCKET_REFRESH;
            return true;
        }

        // Full bucket: evict a bad node first.
        if let Some(i) = bucket.live.iter().position(|c| c.liveness(now) == Liveness::Bad) {
            bucket.live[i] = contact;
            self.refresh_at[idx] = now + BUCKET_REFRESH;
            return true;
        }

        if contact.is_confirmed() {
            if bucket.replace_node(&contact) {
                self.refresh_at[idx] = now + BUCKET_REFRESH;
                return true;
            }
            return false;
        }

        // Park in the replacement cache until something fails.
        if let Some(c) = bucket.extra.iter_mut().find(|c| c.addr == contact.addr) {
            c.set_pinged();
            return true;
        }

        if bucket.extra.len() >= Bucket::MAX_LEN {
            if let Some(i) = bucket.extra.iter().position(|c| !c.is_pinged()) {
                bucket.extra.remove(i);
            } else if bucket.replace_node(&contact) {
                self.refresh_at[idx] = now + BUCKET_REFRESH;
                return true;
            } else {
                return false;
            }
        }

        bucket.extra.push(contact);
        self.refresh_at[idx] = now + BUCKET_REFRESH;
        true
    }

    /// Up to `count` non-bad contacts closest to `target`, nearest bucket
    /// outward.
    pub fn find_closest<'a>(
        &'a self,
        target: &NodeId,
        out: &mut Vec<&'a Contact>,
        count: usize,
        now: Instant,
    ) {
        let idx = self.idx_of(target);
        self.buckets[idx].get_contacts(out, now);

        let mut i = 1;
        while out.len() < count && (i <= idx || idx + i < BUCKETS) {
            if i <= idx {
                self.buckets[idx - i].get_contacts(out, now);
            }
            if idx + i < BUCKETS {
                self.buckets[idx + i].get_contacts(out, now);
            }
            i += 1;
        }

        out.truncate(count);
    }

    pub fn find_contact(&mut self, id: &NodeId) -> Option<&mut Contact> {
        let idx = self.idx_of(id);
        self.buckets[idx].live.iter_mut().find(|c| c.id == *id)
    }

    pub fn failed(&mut self, id: &NodeId) {
        if let Some(c) = self.find_contact(id) {
            c.timed_out();
        }
    }

    /// A reply arrived from this node with the wrong id; condemn it.
    pub fn invalidate(&mut self, id: &NodeId) {
        if let Some(c) = self.find_contact(id) {
            c.invalidate();
        }
    }

    pub fn heard_from(&mut self, id: &NodeId, now: Instant) {
        let idx = self.idx_of(id);
        if let Some(c) = self.buckets[idx].live.iter_mut().find(|c| c.id == *id) {
            c.set_confirmed(now);
            self.refresh_at[idx] = now + BUCKET_REFRESH;
        }
    }

    fn idx_of(&self, id: &NodeId) -> usize {
        self.own_id.xor_leading_zeros(id).min(BUCKETS - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        ([10, 0, 0, 1], port).into()
    }

    #[test]
    fn add_and_dedup() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::all(0), vec![], now);
        assert!(table.is_empty());

        let c = Contact::new(NodeId::all(1), addr(100));
        assert!(table.add_contact(c.clone(), now));
        assert_eq!(table.len(), 1);

        // Same contact again: confirmed, not duplicated.
        assert!(table.add_contact(c, now));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn own_id_and_routers_rejected() {
        let now = Instant::now();
        let router = addr(9999);
        let mut table = RoutingTable::new(NodeId::all(0), vec![router], now);

        assert!(!table.add_contact(Contact::new(NodeId::all(0), addr(1)), now));
        assert!(!table.add_contact(Contact::new(NodeId::all(1), router), now));
        assert!(table.is_empty());
    }

    #[test]
    fn overflow_goes_to_replacement_cache() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::all(0), vec![], now);

        // Ids sharing the same top bit land in the same bucket (distance 0).
        for i in 0..9u8 {
            let mut id = NodeId::all(0);
            id[0] = 0x80;
            id[19] = i;
            table.add_contact(Contact::new(id, addr(100 + i as u16)), now);
        }

        assert_eq!(table.len(), 8);
        assert_eq!(table.len_extra(), 1);
    }

    #[test]
    fn bad_node_evicted_on_insert() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::all(0), vec![], now);

        let mut ids = vec![];
        for i in 0..8u8 {
            let mut id = NodeId::all(0);
            id[0] = 0x80;
            id[19] = i;
            ids.push(id);
            table.add_contact(Contact::new(id, addr(100 + i as u16)), now);
        }

        for _ in 0..5 {
            table.failed(&ids[2]);
        }

        let mut fresh = NodeId::all(0);
        fresh[0] = 0x80;
        fresh[19] = 100;
        assert!(table.add_contact(Contact::new(fresh, addr(999)), now));
        assert_eq!(table.len(), 8);
        assert!(table.find_contact(&fresh).is_some());
        assert!(table.find_contact(&ids[2]).is_none());
    }

    #[test]
    fn closest_ordering() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::all(0), vec![], now);

        fn node(i: usize) -> NodeId {
            let mut id = NodeId::new();
            id[i] = 1;
            id
        }

        for i in 0..20 {
            assert!(table.add_contact(Contact::new(node(i), addr(i as u16 + 1)), now));
        }

        let mut out = Vec::new();
        table.find_closest(&NodeId::all(1), &mut out, 20, now);
        assert_eq!(out.len(), 20);
        for (i, c) in out.iter().enumerate() {
            assert_eq!(c.id, node(i));
        }

        let mut eight = Vec::new();
        table.find_closest(&NodeId::all(1), &mut eight, 8, now);
        assert_eq!(eight.len(), 8);
    }

    #[test]
    fn closest_excludes_bad_nodes() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::all(0), vec![], now);

        table.add_contact(Contact::new(NodeId::all(1), addr(1)), now);
        table.add_contact(Contact::new(NodeId::all(2), addr(2)), now);
        for _ in 0..5 {
            table.failed(&NodeId::all(2));
        }

        let mut out = Vec::new();
        table.find_closest(&NodeId::all(1), &mut out, 8, now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, NodeId::all(1));
    }

    #[test]
    fn full_bucket_refresh_pings_questionable_head() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::all(0), vec![], now);

        // 8 live plus 8 in the replacement cache fill bucket 0.
        for i in 0..16u8 {
            let mut id = NodeId::all(0);
            id[0] = 0x80;
            id[19] = i;
            table.add_contact(Contact::new(id, addr(100 + i as u16)), now);
        }
        assert!(table.bucket(0).is_full());

        let due = now + BUCKET_REFRESH;
        match table.next_refresh(due) {
            Some(ClientRequest::Ping { .. }) => {}
            _ => panic!("expected a ping of the questionable head"),
        }
    }

    #[test]
    fn expiry_drops_silent_nodes() {
        let start = Instant::now();
        let mut table = RoutingTable::new(NodeId::all(0), vec![], start);

        let old = Contact::new(NodeId::all(1), addr(1));
        table.add_contact(old.clone(), start);
        table.heard_from(&old.id, start);

        // Heard from one node much later; the other went silent.
        let fresh = Contact::new(NodeId::all(2), addr(2));
        let later = start + Duration::from_secs(4 * 60 * 60);
        table.add_contact(fresh.clone(), later);
        table.heard_from(&fresh.id, later);

        table.expire_stale(later);
        assert!(table.find_contact(&old.id).is_none());
        assert!(table.find_contact(&fresh.id).is_some());
    }

    #[test]
    fn refresh_produces_lookup_for_sparse_bucket() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::all(0), vec![], now);
        assert!(table.next_refresh(now).is_none());

        let due = now + BUCKET_REFRESH;
        match table.next_refresh(due) {
            Some(ClientRequest::Bootstrap { .. }) => {}
            other => panic!("expected bootstrap refresh, got {:?}", other.is_some()),
        }
    }
}

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bencode::DictEncoder;
use hashbrown::HashMap;
use slab::Slab;

use crate::bucket::Bucket;
use crate::contact::{write_compact_addr, Contact};
use crate::id::NodeId;
use crate::msg::recv::{ErrorResponse, Msg, Query, QueryKind, Response};
use crate::msg::TxnId;
use crate::server::task::Task;
use crate::server::TaskId;
use crate::store::PeerStore;
use crate::table::RoutingTable;
use crate::token::TokenStore;

/// Outstanding-transaction cap per server; queries beyond it queue.
const MAX_PENDING_TXNS: usize = 100;

const TXN_TIMEOUT: Duration = Duration::from_secs(5);

/// Scheduling class for outgoing datagrams when the transaction table is
/// full. Replies never wait (they carry no transaction of ours).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Reply = 0,
    Low = 1,
    High = 2,
}

pub enum Event {
    FoundPeers {
        task_id: TaskId,
        peers: Vec<SocketAddr>,
    },
    Bootstrapped {
        task_id: TaskId,
    },
    Announced {
        task_id: TaskId,
        nodes: usize,
    },
    PingDone {
        task_id: TaskId,
        alive: bool,
    },
    Transmit {
        node_id: NodeId,
        data: Vec<u8>,
        target: SocketAddr,
    },
    Reply {
        data: Vec<u8>,
        target: SocketAddr,
    },
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FoundPeers { peers, .. } => {
                f.debug_struct("FoundPeers").field("peers", &peers.len()).finish()
            }
            Self::Bootstrapped { .. } => f.debug_struct("Bootstrapped").finish(),
            Self::Announced { nodes, .. } => {
                f.debug_struct("Announced").field("nodes", nodes).finish()
            }
            Self::PingDone { alive, .. } => {
                f.debug_struct("PingDone").field("alive", alive).finish()
            }
            Self::Transmit { target, .. } => {
                f.debug_struct("Transmit").field("target", target).finish()
            }
            Self::Reply { target, .. } => f.debug_struct("Reply").field("target", target).finish(),
        }
    }
}

/// One outstanding query.
pub struct Request {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub deadline: Instant,
    pub retries: u8,
    pub has_id: bool,
    pub task_id: TaskId,
    data: Vec<u8>,
}

struct QueuedQuery {
    txn_id: TxnId,
    priority: Priority,
    request: Request,
}

pub struct RpcManager {
    pub own_id: NodeId,
    /// Announce tokens other nodes handed us, per address.
    pub tokens: HashMap<SocketAddr, Vec<u8>>,
    pub events: VecDeque<Event>,
    pending: HashMap<TxnId, Request>,
    queued: VecDeque<QueuedQuery>,
    next_txn: u8,
}

impl RpcManager {
    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            tokens: HashMap::new(),
            events: VecDeque::new(),
            pending: HashMap::new(),
            queued: VecDeque::new(),
            next_txn: 0,
        }
    }

    pub fn pending_txns(&self) -> usize {
        self.pending.len()
    }

    pub fn add_event(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn reply(&mut self, data: Vec<u8>, target: SocketAddr) {
        self.add_event(Event::Reply { data, target });
    }

    /// Send a query to `addr`, tracked under `task_id`. The closure encodes
    /// the datagram for the allocated transaction id. Queued (not dropped)
    /// when the transaction table is full.
    pub fn query<F>(
        &mut self,
        priority: Priority,
        task_id: TaskId,
        id: &NodeId,
        addr: SocketAddr,
        retries: u8,
        now: Instant,
        encode: F,
    ) where
        F: FnOnce(TxnId, &NodeId) -> Vec<u8>,
    {
        let txn_id = self.alloc_txn();
        let own_id = self.own_id;
        let data = encode(txn_id, &own_id);

        let request = Request {
            id: if id.is_zero() { NodeId::gen() } else { *id },
            addr,
            deadline: now + TXN_TIMEOUT,
            retries,
            has_id: !id.is_zero(),
            task_id,
            data,
        };

        if self.pending.len() < MAX_PENDING_TXNS {
            self.transmit_request(txn_id, request);
        } else {
            log::debug!("Transaction table full, queueing {:?}", txn_id);
            let item = QueuedQuery {
                txn_id,
                priority,
                request,
            };
            // Higher priority class goes ahead of lower ones.
            let pos = self
                .queued
                .iter()
                .position(|q| (q.priority as u8) < (item.priority as u8))
                .unwrap_or(self.queued.len());
            self.queued.insert(pos, item);
        }
    }

    fn transmit_request(&mut self, txn_id: TxnId, request: Request) {
        self.add_event(Event::Transmit {
            node_id: request.id,
            data: request.data.clone(),
            target: request.addr,
        });
        self.pending.insert(txn_id, request);
    }

    fn alloc_txn(&mut self) -> TxnId {
        // Pending plus queued can never reach 256 entries, so this
        // terminates.
        loop {
            let candidate = TxnId(self.next_txn);
            self.next_txn = self.next_txn.wrapping_add(1);

            if !self.pending.contains_key(&candidate)
                && !self.queued.iter().any(|q| q.txn_id == candidate)
            {
                return candidate;
            }
        }
    }

    fn drain_queued(&mut self, now: Instant) {
        while self.pending.len() < MAX_PENDING_TXNS {
            match self.queued.pop_front() {
                Some(mut q) => {
                    q.request.deadline = now + TXN_TIMEOUT;
                    self.transmit_request(q.txn_id, q.request);
                }
                None => break,
            }
        }
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.pending.values().map(|req| req.deadline).min()
    }

    /// Expire overdue transactions: retry the ones with retries left, fail
    /// the rest into their tasks, then promote queued queries.
    pub fn check_timeouts(
        &mut self,
        table: &mut RoutingTable,
        tasks: &mut Slab<Box<dyn Task>>,
        now: Instant,
    ) {
        if self.pending.is_empty() && self.queued.is_empty() {
            return;
        }

        let expired: Vec<TxnId> = self
            .pending
            .iter()
            .filter(|(_, req)| req.deadline <= now)
            .map(|(txn, _)| *txn)
            .collect();

        for txn_id in expired {
            let mut req = match self.pending.remove(&txn_id) {
                Some(r) => r,
                None => continue,
            };

            if req.retries > 0 {
                log::trace!("Txn {:?} expired, retrying", txn_id);
                req.retries -= 1;
                req.deadline = now + TXN_TIMEOUT;
                self.transmit_request(txn_id, req);
                continue;
            }

            log::trace!("Txn {:?} expired", txn_id);
            if req.has_id {
                table.failed(&req.id);
            }

            if let Some(task) = tasks.get_mut(req.task_id.0) {
                task.set_failed(&req.id, &req.addr);
                let done = task.add_requests(self, now);
                if done {
                    tasks.remove(req.task_id.0).done(self, now);
                }
            }
        }

        self.drain_queued(now);
    }

    pub fn handle_msg(
        &mut self,
        msg: Msg<'_>,
        addr: SocketAddr,
        table: &mut RoutingTable,
        tasks: &mut Slab<Box<dyn Task>>,
        tokens: &mut TokenStore,
        peers: &mut PeerStore,
        now: Instant,
    ) {
        match msg {
            Msg::Response(r) => self.handle_ok(r, addr, table, tasks, now),
            Msg::Error(e) => self.handle_error(e, addr, table, tasks, now),
            Msg::Query(q) => self.handle_query(q, addr, table, tokens, peers, now),
        }
        self.drain_queued(now);
    }

    fn handle_ok(
        &mut self,
        resp: Response<'_>,
        addr: SocketAddr,
        table: &mut RoutingTable,
        tasks: &mut Slab<Box<dyn Task>>,
        now: Instant,
    ) {
        let req = match self.pending.remove(&resp.txn_id) {
            Some(req) => req,
            None => {
                log::warn!("Response for unrecognized txn: {:?}", resp.txn_id);
                return;
            }
        };

        if req.has_id && req.id != resp.id {
            log::warn!(
                "ID mismatch from {}, expected {:?}, got {:?}",
                addr,
                req.id,
                resp.id
            );
            table.invalidate(&req.id);

            if let Some(task) = tasks.get_mut(req.task_id.0) {
                task.set_failed(&req.id, &addr);
                let done = task.add_requests(self, now);
                if done {
                    tasks.remove(req.task_id.0).done(self, now);
                }
            }
            return;
        }

        // A valid reply makes the responder a good contact.
        let mut contact = Contact::new(resp.id, addr);
        contact.set_confirmed(now);
        table.add_contact(contact, now);
        table.heard_from(&resp.id, now);

        if let Some(task) = tasks.get_mut(req.task_id.0) {
            task.handle_response(&resp, &addr, table, self, req.has_id, now);
            let done = task.add_requests(self, now);
            if done {
                tasks.remove(req.task_id.0).done(self, now);
            }
        }
    }

    fn handle_error(
        &mut self,
        err: ErrorResponse<'_>,
        addr: SocketAddr,
        table: &mut RoutingTable,
        tasks: &mut Slab<Box<dyn Task>>,
        now: Instant,
    ) {
        log::debug!("Error from {}: {} {:?}", addr, err.code, err.message);

        let req = match self.pending.remove(&err.txn_id) {
            Some(req) => req,
            None => {
                log::warn!("Error for unrecognized txn: {:?}", err.txn_id);
                return;
            }
        };

        if req.has_id {
            table.failed(&req.id);
        }

        if let Some(task) = tasks.get_mut(req.task_id.0) {
            task.set_failed(&req.id, &addr);
            let done = task.add_requests(self, now);
            if done {
                tasks.remove(req.task_id.0).done(self, now);
            }
        }
    }

    fn handle_query(
        &mut self,
        query: Query<'_>,
        addr: SocketAddr,
        table: &mut RoutingTable,
        tokens: &mut TokenStore,
        peers: &mut PeerStore,
        now: Instant,
    ) {
        table.heard_from(&query.id, now);
        table.add_contact(Contact::new(query.id, addr), now);

        let mut buf = Vec::new();

        match query.kind {
            QueryKind::Ping => {
                let mut dict = DictEncoder::new(&mut buf);
                let mut r = dict.insert_dict("r");
                r.insert("id", &self.own_id);
                r.finish();
                dict.insert("t", query.txn);
                dict.insert("y", "r");
                dict.finish();
            }
            QueryKind::FindNode | QueryKind::GetPeers => {
                let target_key = if query.kind == QueryKind::FindNode {
                    "target"
                } else {
                    "info_hash"
                };

                let target = match query.args.get_bytes(target_key).and_then(NodeId::from_bytes) {
                    Some(t) => t,
                    None => {
                        self.reply_error(query.txn, 203, "missing target", addr);
                        return;
                    }
                };

                let mut closest = Vec::with_capacity(Bucket::MAX_LEN);
                table.find_closest(&target, &mut closest, Bucket::MAX_LEN, now);

                let mut nodes = Vec::with_capacity(closest.len() * 26);
                for c in closest {
                    c.write_compact(&mut nodes);
                }

                let mut dict = DictEncoder::new(&mut buf);
                let mut r = dict.insert_dict("r");
                r.insert("id", &self.own_id);
                r.insert("nodes", nodes);

                if query.kind == QueryKind::GetPeers {
                    r.insert("token", &tokens.make_token(addr)[..]);

                    let known = peers.get(&target, now);
                    if !known.is_empty() {
                        let mut values = r.insert_list("values");
                        for peer in known {
                            let mut compact = Vec::with_capacity(6);
                            write_compact_addr(&mut compact, peer);
                            values.push(compact);
                        }
                        values.finish();
                    }
                }

                r.finish();
                dict.insert("t", query.txn);
                dict.insert("y", "r");
                dict.finish();
            }
            QueryKind::AnnouncePeer => {
                let info_hash = match query
                    .args
                    .get_bytes("info_hash")
                    .and_then(NodeId::from_bytes)
                {
                    Some(h) => h,
                    None => {
                        self.reply_error(query.txn, 203, "missing info_hash", addr);
                        return;
                    }
                };

                let token = query.args.get_bytes("token").unwrap_or_default();
                if !tokens.is_valid(addr, token) {
                    log::debug!("Bad announce token from {}", addr);
                    self.reply_error(query.txn, 203, "bad token", addr);
                    return;
                }

                let implied = query.args.get_int("implied_port").unwrap_or(0) != 0;
                let port = if implied {
                    addr.port()
                } else {
                    match query.args.get_int("port") {
                        Some(p) if (1..=u16::MAX as i64).contains(&p) => p as u16,
                        _ => {
                            self.reply_error(query.txn, 203, "missing port", addr);
                            return;
                        }
                    }
                };

                let mut peer_addr = addr;
                peer_addr.set_port(port);
                peers.insert(info_hash, peer_addr, now);

                let mut dict = DictEncoder::new(&mut buf);
                let mut r = dict.insert_dict("r");
                r.insert("id", &self.own_id);
                r.finish();
                dict.insert("t", query.txn);
                dict.insert("y", "r");
                dict.finish();
            }
        }

        self.reply(buf, addr);
    }

    fn reply_error(&mut self, txn: &[u8], code: i64, message: &str, addr: SocketAddr) {
        let mut buf = Vec::new();
        let mut dict = DictEncoder::new(&mut buf);
        let mut e = dict.insert_list("e");
        e.push(code);
        e.push(message);
        e.finish();
        dict.insert("t", txn);
        dict.insert("y", "e");
        dict.finish();
        self.reply(buf, addr);
    }
}

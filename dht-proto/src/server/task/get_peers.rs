use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use bencode::Encode;

use crate::contact::parse_compact_peer;
use crate::id::NodeId;
use crate::msg::recv::Response;
use crate::msg::send::GetPeers;
use crate::server::rpc::{Event, RpcManager};
use crate::server::task::base::BaseTask;
use crate::server::task::{Task, TaskId};
use crate::table::RoutingTable;

/// `get_peers` traversal: collects peer addresses for an info-hash and
/// remembers the announce tokens handed back along the way.
pub struct GetPeersTask {
    pub(crate) base: BaseTask,
    pub(crate) peers: HashSet<SocketAddr>,
}

impl GetPeersTask {
    pub fn new(info_hash: &NodeId, table: &RoutingTable, task_id: TaskId, now: Instant) -> Self {
        Self {
            base: BaseTask::new(info_hash, table, task_id, now),
            peers: HashSet::new(),
        }
    }

    pub(crate) fn record_response(
        &mut self,
        resp: &Response<'_>,
        addr: &SocketAddr,
        table: &mut RoutingTable,
        rpc: &mut RpcManager,
        has_id: bool,
        now: Instant,
    ) {
        self.base.handle_response(resp, addr, table, has_id, now);

        if let Some(token) = resp.body.get_bytes("token") {
            rpc.tokens.insert(*addr, token.to_vec());
        }

        if let Some(values) = resp.body.get_list("values") {
            for v in values {
                match v.as_bytes().and_then(parse_compact_peer) {
                    Some(peer) => {
                        self.peers.insert(peer);
                    }
                    None => log::warn!("Malformed peer entry from {}", addr),
                }
            }
        }
    }
}

impl Task for GetPeersTask {
    fn id(&self) -> TaskId {
        self.base.task_id
    }

    fn add_requests(&mut self, rpc: &mut RpcManager, now: Instant) -> bool {
        let info_hash = self.base.target;
        self.base.add_requests(rpc, now, |txn_id, own_id, buf| {
            GetPeers {
                txn_id,
                id: *own_id,
                info_hash,
            }
            .encode(buf);
        })
    }

    fn set_failed(&mut self, id: &NodeId, addr: &SocketAddr) {
        self.base.set_failed(id, addr);
    }

    fn handle_response(
        &mut self,
        resp: &Response<'_>,
        addr: &SocketAddr,
        table: &mut RoutingTable,
        rpc: &mut RpcManager,
        has_id: bool,
        now: Instant,
    ) {
        self.record_response(resp, addr, table, rpc, has_id, now);
    }

    fn done(&mut self, rpc: &mut RpcManager, _now: Instant) {
        log::info!("Found {} peers", self.peers.len());
        rpc.add_event(Event::FoundPeers {
            task_id: self.base.task_id,
            peers: std::mem::take(&mut self.peers).into_iter().collect(),
        });
    }
}

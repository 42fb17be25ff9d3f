use std::net::SocketAddr;
use std::time::Instant;

use bencode::Encode;

use crate::id::NodeId;
use crate::msg::recv::Response;
use crate::msg::send::AnnouncePeer;
use crate::server::rpc::{Event, Priority, RpcManager};
use crate::server::task::{GetPeersTask, Task, TaskId};
use crate::table::RoutingTable;

/// `get_peers` traversal followed by `announce_peer` to every close node
/// that handed us a token.
pub struct AnnounceTask {
    inner: GetPeersTask,
    port: u16,
    implied_port: bool,
}

impl AnnounceTask {
    pub fn new(
        info_hash: &NodeId,
        table: &RoutingTable,
        task_id: TaskId,
        port: u16,
        implied_port: bool,
        now: Instant,
    ) -> Self {
        Self {
            inner: GetPeersTask::new(info_hash, table, task_id, now),
            port,
            implied_port,
        }
    }
}

impl Task for AnnounceTask {
    fn id(&self) -> TaskId {
        self.inner.base.task_id
    }

    fn add_requests(&mut self, rpc: &mut RpcManager, now: Instant) -> bool {
        Task::add_requests(&mut self.inner, rpc, now)
    }

    fn set_failed(&mut self, id: &NodeId, addr: &SocketAddr) {
        self.inner.set_failed(id, addr);
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
        self.inner
            .record_response(resp, addr, table, rpc, has_id, now);
    }

    fn done(&mut self, rpc: &mut RpcManager, now: Instant) {
        let info_hash = self.inner.base.target;
        let port = self.port;
        let implied_port = self.implied_port;

        // The traversal settled; hand our endpoint to the closest nodes
        // that authorized us. Replies only refresh the routing table, so
        // these queries are detached from any task.
        let targets: Vec<(NodeId, SocketAddr, Vec<u8>)> = self
            .inner
            .base
            .alive_closest()
            .filter_map(|n| {
                rpc.tokens
                    .get(&n.addr)
                    .map(|token| (n.id, n.addr, token.clone()))
            })
            .collect();

        for (id, addr, token) in &targets {
            rpc.query(
                Priority::High,
                TaskId::DETACHED,
                id,
                *addr,
                0,
                now,
                |txn_id, own_id| {
                    AnnouncePeer {
                        txn_id,
                        id: *own_id,
                        info_hash,
                        implied_port,
                        port,
                        token: &token[..],
                    }
                    .encode_to_vec()
                },
            );
        }

        log::info!(
            "Announced {:?} to {} nodes, found {} peers",
            info_hash,
            targets.len(),
            self.inner.peers.len()
        );

        if !self.inner.peers.is_empty() {
            rpc.add_event(Event::FoundPeers {
                task_id: self.inner.base.task_id,
                peers: std::mem::take(&mut self.inner.peers).into_iter().collect(),
            });
        }

        rpc.add_event(Event::Announced {
            task_id: self.inner.base.task_id,
            nodes: targets.len(),
        });
    }
}

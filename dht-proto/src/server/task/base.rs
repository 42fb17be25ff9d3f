use std::net::SocketAddr;
use std::time::Instant;

use crate::bucket::Bucket;
use crate::contact::{CompactNodes, Contact};
use crate::id::NodeId;
use crate::msg::recv::Response;
use crate::msg::TxnId;
use crate::server::rpc::{Priority, RpcManager};
use crate::server::task::{Status, TaskId, TaskNode};
use crate::table::RoutingTable;

/// Cap on the candidate set; everything beyond the closest 100 is pruned.
const MAX_NODES: usize = 100;

const BRANCH_FACTOR: u8 = 3;

/// Shared state of the iterative lookups: a candidate list sorted by XOR
/// distance to the target, queried α nodes at a time until the closest `K`
/// have answered.
pub struct BaseTask {
    pub target: NodeId,
    pub nodes: Vec<TaskNode>,
    pub branch_factor: u8,
    pub task_id: TaskId,
}

impl BaseTask {
    pub fn new(target: &NodeId, table: &RoutingTable, task_id: TaskId, now: Instant) -> Self {
        let mut closest = Vec::with_capacity(Bucket::MAX_LEN);
        table.find_closest(target, &mut closest, Bucket::MAX_LEN, now);

        let mut nodes: Vec<TaskNode> = closest.iter().map(|c| TaskNode::new(c, target)).collect();

        log::debug!("Starting traversal with {} known nodes", nodes.len());

        if nodes.len() < 3 {
            // Too sparse; fall back to the routers.
            for addr in table.router_nodes() {
                nodes.push(TaskNode {
                    id: NodeId::new(),
                    key: *target,
                    addr: *addr,
                    status: Status::INITIAL | Status::NO_ID,
                });
            }
        }

        nodes.sort_unstable_by_key(|n| n.key);

        Self {
            target: *target,
            nodes,
            branch_factor: BRANCH_FACTOR,
            task_id,
        }
    }

    pub fn handle_response(
        &mut self,
        resp: &Response<'_>,
        addr: &SocketAddr,
        table: &mut RoutingTable,
        has_id: bool,
        now: Instant,
    ) {
        if has_id {
            let key = resp.id ^ self.target;
            if let Ok(i) = self.nodes.binary_search_by_key(&key, |n| n.key) {
                self.nodes[i].status.insert(Status::ALIVE);
            } else {
                log::warn!("Response from a node missing in the traversal: {:?}", resp.id);
                return;
            }
        } else if let Some(node) = self.nodes.iter_mut().find(|n| n.addr == *addr) {
            node.set_id(resp.id, &self.target);
            node.status.insert(Status::ALIVE);
            self.nodes.sort_unstable_by_key(|n| n.key);
        }

        // Fold returned contacts into the table and the candidate list.
        if let Some(buf) = resp.body.get_bytes("nodes") {
            match CompactNodes::new(buf) {
                Ok(contacts) => {
                    for c in contacts {
                        if c.id == table.own_id {
                            continue;
                        }
                        let key = c.id ^ self.target;
                        if let Err(i) = self.nodes.binary_search_by_key(&key, |n| n.key) {
                            self.nodes.insert(i, TaskNode::new(&c, &self.target));
                        }
                        table.add_contact(c, now);
                    }
                }
                Err(e) => log::warn!("Bad nodes from {}: {}", addr, e),
            }
        }

        self.nodes.truncate(MAX_NODES);
    }

    pub fn set_failed(&mut self, id: &NodeId, addr: &SocketAddr) {
        let key = *id ^ self.target;
        if let Ok(i) = self.nodes.binary_search_by_key(&key, |n| n.key) {
            self.nodes[i].status.insert(Status::FAILED);
        } else if let Some(node) = self.nodes.iter_mut().find(|n| n.addr == *addr) {
            node.status.insert(Status::FAILED);
        }
    }

    /// Query unvisited candidates closest-first, keeping at most
    /// `branch_factor` in flight. Returns true when the traversal is
    /// complete: the closest `K` candidates answered, or everything failed.
    pub fn add_requests<F>(&mut self, rpc: &mut RpcManager, now: Instant, mut write_msg: F) -> bool
    where
        F: FnMut(TxnId, &NodeId, &mut Vec<u8>),
    {
        let mut pending = 0;
        let mut alive = 0;

        for n in &mut self.nodes {
            if alive >= Bucket::MAX_LEN || pending >= self.branch_factor as usize {
                break;
            }

            if n.status.contains(Status::ALIVE) {
                alive += 1;
                continue;
            }

            if n.status.contains(Status::QUERIED) {
                if !n.status.contains(Status::FAILED) {
                    pending += 1;
                }
                continue;
            }

            log::trace!("Query {:?} at {}", n.id, n.addr);
            n.status.insert(Status::QUERIED);

            let id = if n.status.contains(Status::NO_ID) {
                NodeId::new()
            } else {
                n.id
            };

            rpc.query(
                Priority::Low,
                self.task_id,
                &id,
                n.addr,
                0,
                now,
                |txn_id, own_id| {
                    let mut buf = Vec::new();
                    write_msg(txn_id, own_id, &mut buf);
                    buf
                },
            );

            pending += 1;
        }

        pending == 0
    }

    /// The closest alive nodes, for announce follow-ups.
    pub fn alive_closest(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes
            .iter()
            .filter(|n| n.status.contains(Status::ALIVE))
            .take(Bucket::MAX_LEN)
    }
}

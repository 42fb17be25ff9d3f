use std::net::SocketAddr;
use std::time::Instant;

use crate::contact::Contact;
use crate::id::NodeId;
use crate::msg::recv::Response;
use crate::server::rpc::RpcManager;
use crate::table::RoutingTable;

mod announce;
mod base;
mod bootstrap;
mod get_peers;
mod ping;

pub use announce::AnnounceTask;
pub use bootstrap::BootstrapTask;
pub use get_peers::GetPeersTask;
pub use ping::PingTask;

/// An iterative lookup in progress. Driven by the rpc layer: responses and
/// failures are fed in, `add_requests` tops the traversal back up to the
/// branch factor and reports completion.
pub trait Task: Send {
    fn id(&self) -> TaskId;

    /// Issue queries until the branch factor is reached. Returns true when
    /// the task has finished.
    fn add_requests(&mut self, rpc: &mut RpcManager, now: Instant) -> bool;

    fn set_failed(&mut self, id: &NodeId, addr: &SocketAddr);

    fn handle_response(
        &mut self,
        resp: &Response<'_>,
        addr: &SocketAddr,
        table: &mut RoutingTable,
        rpc: &mut RpcManager,
        has_id: bool,
        now: Instant,
    );

    fn done(&mut self, _rpc: &mut RpcManager, _now: Instant) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    /// Sentinel for fire-and-forget queries that outlive their task.
    pub(crate) const DETACHED: TaskId = TaskId(usize::MAX);
}

bitflags::bitflags! {
    pub struct Status: u8 {
        const INITIAL = 1 << 0;
        const QUERIED = 1 << 1;
        const ALIVE   = 1 << 2;
        const FAILED  = 1 << 3;
        const NO_ID   = 1 << 4;
    }
}

/// A traversal candidate, ordered by XOR distance to the target.
pub struct TaskNode {
    pub id: NodeId,
    pub key: NodeId,
    pub addr: SocketAddr,
    pub status: Status,
}

impl TaskNode {
    pub fn new(c: &Contact, target: &NodeId) -> Self {
        Self {
            id: c.id,
            key: c.id ^ *target,
            addr: c.addr,
            status: Status::INITIAL,
        }
    }

    pub fn set_id(&mut self, id: NodeId, target: &NodeId) {
        self.id = id;
        self.key = id ^ *target;
        self.status.remove(Status::NO_ID);
    }
}

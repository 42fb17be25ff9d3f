use std::net::SocketAddr;
use std::time::Instant;

use bencode::Encode;

use crate::id::NodeId;
use crate::msg::recv::Response;
use crate::msg::send::FindNode;
use crate::server::rpc::{Event, RpcManager};
use crate::server::task::base::BaseTask;
use crate::server::task::{Task, TaskId};
use crate::table::RoutingTable;

/// `find_node` traversal toward a target id; fills the routing table as a
/// side effect. Used for bootstrap and bucket refresh.
pub struct BootstrapTask {
    base: BaseTask,
}

impl BootstrapTask {
    pub fn new(target: &NodeId, table: &RoutingTable, task_id: TaskId, now: Instant) -> Self {
        Self {
            base: BaseTask::new(target, table, task_id, now),
        }
    }
}

impl Task for BootstrapTask {
    fn id(&self) -> TaskId {
        self.base.task_id
    }

    fn add_requests(&mut self, rpc: &mut RpcManager, now: Instant) -> bool {
        let target = self.base.target;
        self.base.add_requests(rpc, now, |txn_id, own_id, buf| {
            FindNode {
                txn_id,
                id: *own_id,
                target,
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
        _rpc: &mut RpcManager,
        has_id: bool,
        now: Instant,
    ) {
        self.base.handle_response(resp, addr, table, has_id, now);
    }

    fn done(&mut self, rpc: &mut RpcManager, _now: Instant) {
        rpc.add_event(Event::Bootstrapped {
            task_id: self.base.task_id,
        });
    }
}

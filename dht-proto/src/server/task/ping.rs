use std::net::SocketAddr;
use std::time::Instant;

use bencode::Encode;

use crate::id::NodeId;
use crate::msg::recv::Response;
use crate::msg::send::Ping;
use crate::server::rpc::{Event, Priority, RpcManager};
use crate::server::task::{Task, TaskId};
use crate::table::RoutingTable;

/// Liveness check of a single node (bucket maintenance).
pub struct PingTask {
    id: NodeId,
    addr: SocketAddr,
    task_id: TaskId,
    queried: bool,
    resolved: bool,
    alive: bool,
}

impl PingTask {
    pub fn new(id: &NodeId, addr: &SocketAddr, task_id: TaskId) -> Self {
        Self {
            id: *id,
            addr: *addr,
            task_id,
            queried: false,
            resolved: false,
            alive: false,
        }
    }
}

impl Task for PingTask {
    fn id(&self) -> TaskId {
        self.task_id
    }

    fn add_requests(&mut self, rpc: &mut RpcManager, now: Instant) -> bool {
        if self.queried {
            return self.resolved;
        }

        self.queried = true;
        rpc.query(
            Priority::High,
            self.task_id,
            &self.id,
            self.addr,
            1,
            now,
            |txn_id, own_id| {
                Ping {
                    txn_id,
                    id: *own_id,
                }
                .encode_to_vec()
            },
        );

        false
    }

    fn set_failed(&mut self, _id: &NodeId, _addr: &SocketAddr) {
        self.resolved = true;
        self.alive = false;
    }

    fn handle_response(
        &mut self,
        _resp: &Response<'_>,
        _addr: &SocketAddr,
        _table: &mut RoutingTable,
        _rpc: &mut RpcManager,
        _has_id: bool,
        _now: Instant,
    ) {
        self.resolved = true;
        self.alive = true;
    }

    fn done(&mut self, rpc: &mut RpcManager, _now: Instant) {
        log::debug!("Ping of {} done, alive: {}", self.addr, self.alive);
        rpc.add_event(Event::PingDone {
            task_id: self.task_id,
            alive: self.alive,
        });
    }
}

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dht_proto::{ClientRequest, Dht, Event, NodeCache, NodeId, TaskId};
use hashbrown::HashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

/// Datagrams above this are not DHT traffic.
const MAX_DATAGRAM: usize = 2048;

pub enum DhtCommand {
    /// Look up peers and announce our listen port for an info-hash.
    Announce {
        info_hash: NodeId,
        port: u16,
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    AddNode(SocketAddr),
    Save(oneshot::Sender<Vec<u8>>),
    Shutdown,
}

#[derive(Clone)]
pub struct DhtHandle {
    tx: UnboundedSender<DhtCommand>,
}

impl DhtHandle {
    pub async fn announce(&self, info_hash: NodeId, port: u16) -> Vec<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(DhtCommand::Announce {
                info_hash,
                port,
                reply,
            })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn add_node(&self, addr: SocketAddr) {
        let _ = self.tx.send(DhtCommand::AddNode(addr));
    }

    /// Bencoded node cache for persistence across runs.
    pub async fn save(&self) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DhtCommand::Save(reply)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(DhtCommand::Shutdown);
    }
}

/// Spawn the async driver around a sans-io [`Dht`].
pub fn spawn(socket: UdpSocket, cache: Option<NodeCache>, routers: Vec<SocketAddr>) -> DhtHandle {
    let now = Instant::now();
    let dht = match &cache {
        Some(c) => Dht::from_cache(c, routers, now),
        None => Dht::new(NodeId::gen(), routers, now),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(socket, dht, rx));
    DhtHandle { tx }
}

async fn run(socket: UdpSocket, mut dht: Dht, mut commands: UnboundedReceiver<DhtCommand>) {
    let mut pending: HashMap<TaskId, oneshot::Sender<Vec<SocketAddr>>> = HashMap::new();
    let mut buf = [0u8; MAX_DATAGRAM];

    log::info!("DHT running as {:?}", dht.own_id());

    loop {
        let now = Instant::now();
        dht.tick(now);
        drain_events(&socket, &mut dht, &mut pending).await;

        let next = dht.next_timeout();
        let sleep = next
            .checked_duration_since(now)
            .unwrap_or(Duration::from_millis(0))
            .min(Duration::from_secs(1));

        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, addr)) => dht.receive(&buf[..n], addr, Instant::now()),
                    Err(e) => log::debug!("DHT socket error: {}", e),
                }
            }

            cmd = commands.recv() => match cmd {
                Some(DhtCommand::Announce { info_hash, port, reply }) => {
                    let request = ClientRequest::Announce {
                        info_hash,
                        port,
                        implied_port: false,
                    };
                    match dht.add_request(request, Instant::now()) {
                        Some(task_id) => {
                            pending.insert(task_id, reply);
                        }
                        None => {
                            let _ = reply.send(Vec::new());
                        }
                    }
                }
                Some(DhtCommand::AddNode(addr)) => {
                    dht.add_bootstrap_candidate(addr);
                }
                Some(DhtCommand::Save(reply)) => {
                    let _ = reply.send(dht.cache(Instant::now()).encode());
                }
                Some(DhtCommand::Shutdown) | None => {
                    log::debug!("DHT driver stopping");
                    return;
                }
            },

            _ = tokio::time::sleep(sleep) => {}
        }

        drain_events(&socket, &mut dht, &mut pending).await;
    }
}

async fn drain_events(
    socket: &UdpSocket,
    dht: &mut Dht,
    pending: &mut HashMap<TaskId, oneshot::Sender<Vec<SocketAddr>>>,
) {
    while let Some(event) = dht.poll_event() {
        match event {
            Event::Transmit { data, target, .. } | Event::Reply { data, target } => {
                if let Err(e) = socket.send_to(&data, target).await {
                    log::debug!("DHT send to {} failed: {}", target, e);
                }
            }
            Event::FoundPeers { task_id, peers } => {
                if let Some(reply) = pending.remove(&task_id) {
                    let _ = reply.send(peers);
                }
            }
            Event::Announced { task_id, nodes } => {
                log::debug!("Announced to {} nodes", nodes);
                // Lookup that found nothing: answer the waiter with
                // an empty set.
                if let Some(reply) = pending.remove(&task_id) {
                    let _ = reply.send(Vec::new());
                }
            }
            Event::Bootstrapped { .. } => {
                log::debug!("DHT bootstrap pass finished");
            }
            Event::PingDone { .. } => {}
        }
    }
}

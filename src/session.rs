use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peer_proto::handshake::Handshake;
use tokio::net::{TcpListener, UdpSocket};

use crate::config::{Config, DhtMode};
use crate::dht::DhtHandle;
use crate::error::{Error, Result};
use crate::hash::HashQueue;
use crate::metainfo::Metainfo;
use crate::peer::handshake::incoming_any;
use crate::peer::{generate_peer_id, PeerId};
use crate::storage::FilePool;
use crate::torrent::{Torrent, TorrentHandle};

const ANNOUNCE_EVERY: Duration = Duration::from_secs(5 * 60);
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(60);

struct Registry {
    torrents: Vec<(Handshake, TorrentHandle)>,
}

/// Process-wide engine context: one listener, one file pool, one hash
/// worker and an optional DHT node shared by every torrent.
///
/// Construction wires everything; the context is then passed by `Arc`
/// rather than through globals.
pub struct Session {
    cfg: Config,
    peer_id: PeerId,
    listen_port: u16,
    pool: Arc<FilePool>,
    hash: Arc<HashQueue>,
    dht: Option<DhtHandle>,
    registry: Arc<Mutex<Registry>>,
    next_owner: AtomicU64,
}

impl Session {
    /// Bind the TCP listener (and the DHT's UDP socket) on the first free
    /// port of the configured range and start the accept loop.
    pub async fn bind(cfg: Config) -> Result<Arc<Session>> {
        Self::bind_with_dht_cache(cfg, None).await
    }

    pub async fn bind_with_dht_cache(
        cfg: Config,
        dht_cache: Option<dht_proto::NodeCache>,
    ) -> Result<Arc<Session>> {
        let mut bound = None;
        for port in cfg.listen_ports.clone() {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    // Port 0 asks the kernel for an ephemeral port.
                    let actual = listener.local_addr().map_err(Error::Io)?.port();
                    bound = Some((listener, actual));
                    break;
                }
                Err(e) => log::debug!("Port {} unavailable: {}", port, e),
            }
        }

        let (listener, listen_port) = bound.ok_or_else(|| {
            Error::input(format!("No free port in {:?}", cfg.listen_ports))
        })?;
        log::info!("Listening on port {}", listen_port);

        let dht = if cfg.dht != DhtMode::Off {
            let socket = UdpSocket::bind(("0.0.0.0", listen_port))
                .await
                .map_err(Error::Io)?;
            Some(crate::dht::spawn(socket, dht_cache, Vec::new()))
        } else {
            None
        };

        let session = Arc::new(Session {
            peer_id: generate_peer_id(),
            listen_port,
            pool: Arc::new(FilePool::new(cfg.max_open_files)),
            hash: Arc::new(HashQueue::new()),
            dht,
            registry: Arc::new(Mutex::new(Registry {
                torrents: Vec::new(),
            })),
            next_owner: AtomicU64::new(1),
            cfg,
        });

        tokio::spawn(accept_loop(listener, session.clone()));
        Ok(session)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn dht(&self) -> Option<&DhtHandle> {
        self.dht.as_ref()
    }

    /// Start a torrent; existing on-disk data is verified before any
    /// networking happens.
    pub fn add_torrent(&self, info: Metainfo, root: PathBuf) -> TorrentHandle {
        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed);

        let (torrent, handle) = Torrent::new(
            info.clone(),
            root,
            self.cfg.clone(),
            self.peer_id,
            self.listen_port,
            self.pool.clone(),
            self.hash.clone(),
            owner,
        );

        let mut hs = Handshake::new(info.info_hash, self.peer_id);
        hs.extensions.set_extended(true);
        if self.dht.is_some() && !info.private {
            hs.extensions.set_dht(true);
        }

        {
            let mut registry = self.registry.lock().unwrap();
            registry.torrents.push((hs, handle.clone()));
        }

        tokio::spawn(torrent.run(true));

        // Peer discovery through the DHT, seeded with the descriptor's
        // nodes.
        if let Some(dht) = &self.dht {
            if !info.private {
                for node in &info.nodes {
                    dht.add_node(*node);
                }

                let dht = dht.clone();
                let torrent = handle.clone();
                let info_hash = dht_proto::NodeId::from_bytes(info.info_hash.as_ref())
                    .expect("info-hash is 20 bytes");
                let port = self.listen_port;
                tokio::spawn(async move {
                    loop {
                        let peers = dht.announce(info_hash, port).await;
                        if !peers.is_empty() {
                            torrent.add_peers(peers);
                        }
                        tokio::time::sleep(ANNOUNCE_EVERY).await;
                    }
                });
            }
        }

        handle
    }

    /// Stop every torrent (flushing their storage) and the DHT driver.
    pub async fn shutdown(&self) {
        let handles: Vec<TorrentHandle> = {
            let registry = self.registry.lock().unwrap();
            registry.torrents.iter().map(|(_, h)| h.clone()).collect()
        };

        futures::future::join_all(handles.iter().map(|h| h.shutdown())).await;

        if let Some(dht) = &self.dht {
            dht.shutdown();
        }
    }
}


async fn accept_loop(listener: TcpListener, session: Arc<Session>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                continue;
            }
        };

        log::debug!("Incoming connection from {}", addr);
        stream.set_nodelay(true).ok();

        let session = session.clone();
        tokio::spawn(async move {
            let candidates: Vec<Handshake> = {
                let registry = session.registry.lock().unwrap();
                registry.torrents.iter().map(|(hs, _)| *hs).collect()
            };

            let result = tokio::time::timeout(
                HANDSHAKE_DEADLINE,
                incoming_any(stream, &candidates, session.cfg.encryption),
            )
            .await;

            match result {
                Ok(Ok((outcome, idx))) => {
                    let registry = session.registry.lock().unwrap();
                    if let Some((_, handle)) = registry.torrents.get(idx) {
                        handle.incoming(outcome.stream, outcome.remote, addr);
                    }
                }
                Ok(Err(e)) => log::debug!("Handshake with {} failed: {}", addr, e),
                Err(_) => log::debug!("Handshake with {} timed out", addr),
            }
        });
    }
}

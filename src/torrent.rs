use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use peer_proto::bitfield::Bitfield;
use peer_proto::handshake::Handshake;
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::config::Config;
use crate::delegator::{BlockTransfer, Delegator, PeerKey, Priority, BLOCK_LEN};
use crate::hash::HashQueue;
use crate::metainfo::Metainfo;
use crate::peer::choker::{self, ChokeInput};
use crate::peer::conn::{run_peer, ConnContext, PeerCommand, PeerEvent};
use crate::peer::handshake::{outgoing, PeerStream};
use crate::peer::list::{CullFlags, DisconnectFlags, InsertFlags, PeerList};
use crate::peer::PeerId;
use crate::scheduler::TimerQueue;
use crate::storage::{
    ChunkHandle, ChunkList, ChunkStorage, FilePool, GetFlags, ReleaseFlags, SyncFlags,
};
use crate::throttle::{NodeKey, Rate, Throttle, TICK};

const UNCHOKE_SLOTS: usize = 4;

const REQUEST_CHECK_EVERY: Duration = Duration::from_secs(1);
const SYNC_EVERY: Duration = Duration::from_secs(30);
const PEX_EVERY: Duration = Duration::from_secs(60);
const CULL_EVERY: Duration = Duration::from_secs(5 * 60);
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(60);
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// Floor of the per-request deadline before a request counts as stalled.
const REQUEST_DEADLINE_FLOOR: Duration = Duration::from_secs(10);

/// Pipeline depth bounds per peer.
const MIN_PIPELINE: usize = 4;
const MAX_PIPELINE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerLife {
    Handshaking,
    Active,
    Closing,
}

struct PeerState {
    addr: SocketAddr,
    life: PeerLife,
    cmd: Option<UnboundedSender<PeerCommand>>,
    bits: Bitfield,
    peer_choking: bool,
    peer_interested: bool,
    am_choking: bool,
    am_interested: bool,
    affinity: Option<u32>,
    /// Our requests to them, with issue times.
    outstanding: Vec<(BlockTransfer, Instant)>,
    snubbed: bool,
    down_rate: Rate,
    up_rate: Rate,
    throttle_node: Option<NodeKey>,
    /// When the last PEX message went out, if any.
    last_pex: Option<Instant>,
    list_key: PeerKey,
}

impl PeerState {
    fn is_seeder(&self) -> bool {
        self.bits.is_all_set()
    }
}

pub enum TorrentCommand {
    AddPeers(Vec<SocketAddr>),
    Incoming {
        socket: PeerStream<TcpStream>,
        remote: Handshake,
        addr: SocketAddr,
    },
    DialFinished {
        key: PeerKey,
        result: Result<(PeerStream<TcpStream>, Handshake), String>,
    },
    SetPriority(u32, Priority),
    Status(oneshot::Sender<TorrentStatus>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct TorrentStatus {
    pub name: String,
    pub num_pieces: u32,
    pub have_pieces: u32,
    pub complete: bool,
    pub connected_peers: usize,
    pub downloaded: u64,
    pub uploaded: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Choke,
    RequestCheck,
    Sync,
    Pex,
    Cull,
    Throttle,
}

/// Control handle returned alongside a [`Torrent`].
#[derive(Clone)]
pub struct TorrentHandle {
    pub info_hash: peer_proto::InfoHash,
    cmd: UnboundedSender<TorrentCommand>,
}

impl TorrentHandle {
    pub fn add_peers(&self, peers: Vec<SocketAddr>) {
        let _ = self.cmd.send(TorrentCommand::AddPeers(peers));
    }

    pub fn incoming(&self, socket: PeerStream<TcpStream>, remote: Handshake, addr: SocketAddr) {
        let _ = self.cmd.send(TorrentCommand::Incoming {
            socket,
            remote,
            addr,
        });
    }

    pub fn set_priority(&self, piece: u32, priority: Priority) {
        let _ = self.cmd.send(TorrentCommand::SetPriority(piece, priority));
    }

    pub async fn status(&self) -> Option<TorrentStatus> {
        let (tx, rx) = oneshot::channel();
        self.cmd.send(TorrentCommand::Status(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd.send(TorrentCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// One torrent's engine: peers, piece scheduling, storage and hashing,
/// all driven from a single task.
pub struct Torrent {
    info: Metainfo,
    cfg: Config,
    peer_id: PeerId,
    listen_port: u16,

    chunks: ChunkList,
    handles: hashbrown::HashMap<u32, ChunkHandle>,
    hashing: HashSet<u32>,
    delegator: Delegator,
    hash_queue: Arc<HashQueue>,
    owner: u64,

    own_bits: Bitfield,
    piece_priorities: Vec<Priority>,
    availability: Vec<u32>,

    peers: slab::Slab<PeerState>,
    peer_list: PeerList,

    upload_throttle: Arc<Mutex<Throttle>>,
    download_throttle: Arc<Mutex<Throttle>>,

    events_tx: UnboundedSender<PeerEvent>,
    events_rx: UnboundedReceiver<PeerEvent>,
    hash_tx: UnboundedSender<()>,
    hash_rx: UnboundedReceiver<()>,
    commands: UnboundedReceiver<TorrentCommand>,
    self_cmd: UnboundedSender<TorrentCommand>,

    timers: TimerQueue<Tick>,
    choke_round: u64,
    downloaded: u64,
    uploaded: u64,
    pex_known: HashSet<SocketAddrV4>,
}

impl Torrent {
    /// Build the torrent engine and its control handle. `owner` tags this
    /// torrent's hash submissions.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: Metainfo,
        root: PathBuf,
        cfg: Config,
        peer_id: PeerId,
        listen_port: u16,
        pool: Arc<FilePool>,
        hash_queue: Arc<HashQueue>,
        owner: u64,
    ) -> (Self, TorrentHandle) {
        let storage = ChunkStorage::new(&root, &info.files, info.piece_len, pool);
        let mut chunks = ChunkList::new(storage);
        chunks.set_storage_error_cb(Box::new(|msg| {
            log::error!("{}", msg);
        }));

        let num_pieces = info.num_pieces() as usize;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (hash_tx, hash_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let handle = TorrentHandle {
            info_hash: info.info_hash,
            cmd: cmd_tx.clone(),
        };

        let torrent = Self {
            own_bits: Bitfield::with_size(num_pieces),
            piece_priorities: vec![Priority::Normal; num_pieces],
            availability: vec![0; num_pieces],
            delegator: Delegator::new(cfg.aggressive),
            upload_throttle: Arc::new(Mutex::new(Throttle::new(cfg.upload_rate))),
            download_throttle: Arc::new(Mutex::new(Throttle::new(cfg.download_rate))),
            peers: slab::Slab::new(),
            peer_list: PeerList::new(cfg.max_peers_per_host),
            chunks,
            handles: hashbrown::HashMap::new(),
            hashing: HashSet::new(),
            hash_queue,
            owner,
            info,
            cfg,
            peer_id,
            listen_port,
            events_tx,
            events_rx,
            hash_tx,
            hash_rx,
            commands: cmd_rx,
            self_cmd: cmd_tx,
            timers: TimerQueue::new(),
            choke_round: 0,
            downloaded: 0,
            uploaded: 0,
            pex_known: HashSet::new(),
        };

        (torrent, handle)
    }

    fn own_handshake(&self) -> Handshake {
        let mut hs = Handshake::new(self.info.info_hash, self.peer_id);
        hs.extensions.set_extended(true);
        if self.cfg.dht != crate::config::DhtMode::Off && !self.info.private {
            hs.extensions.set_dht(true);
        }
        hs
    }

    pub fn is_complete(&self) -> bool {
        self.own_bits.is_all_set()
    }

    /// Hash whatever is already on disk and mark the matching pieces.
    /// Pieces are checked in parallel; this runs before networking starts.
    fn verify_local(&mut self) {
        let storage = self.chunks.storage();
        if !storage.files().iter().any(|(path, _)| path.exists()) {
            return;
        }

        let info = &self.info;
        let verified: Vec<u32> = (0..info.num_pieces())
            .into_par_iter()
            .filter_map(|index| {
                let chunk = storage.map(index).ok()?;
                let mut sha = Sha1::new();
                for w in chunk.windows() {
                    sha.update(w.bytes());
                }
                let digest: [u8; 20] = sha.finalize().into();
                (digest[..] == *info.piece_hash(index)).then_some(index)
            })
            .collect();

        for index in verified {
            self.own_bits.set_bit(index as usize);
        }

        log::info!(
            "Resume check: {}/{} pieces verified",
            self.own_bits.count(),
            info.num_pieces()
        );
    }

    /// Run until shutdown. Everything the torrent does funnels through
    /// here: peer events, hash completions, timers and commands.
    pub async fn run(mut self, check_existing: bool) {
        if check_existing {
            self.verify_local();
        }

        let now = Instant::now();
        self.timers.schedule(now + choker::ROTATE_EVERY, Tick::Choke);
        self.timers
            .schedule(now + REQUEST_CHECK_EVERY, Tick::RequestCheck);
        self.timers.schedule(now + SYNC_EVERY, Tick::Sync);
        self.timers.schedule(now + PEX_EVERY, Tick::Pex);
        self.timers.schedule(now + CULL_EVERY, Tick::Cull);
        self.timers.schedule(now + TICK, Tick::Throttle);

        loop {
            let deadline = self
                .timers
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(1));

            tokio::select! {
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.on_peer_event(event);
                    }
                }

                _ = self.hash_rx.recv() => {
                    self.on_hash_completions();
                }

                cmd = self.commands.recv() => match cmd {
                    Some(TorrentCommand::AddPeers(peers)) => {
                        for addr in peers {
                            self.peer_list.insert_address(addr, InsertFlags::AVAILABLE);
                        }
                        self.dial_more();
                    }
                    Some(TorrentCommand::Incoming { socket, remote, addr }) => {
                        self.adopt_incoming(socket, remote, addr);
                    }
                    Some(TorrentCommand::DialFinished { key, result }) => {
                        self.on_dial_finished(key, result);
                    }
                    Some(TorrentCommand::SetPriority(piece, priority)) => {
                        if let Some(p) = self.piece_priorities.get_mut(piece as usize) {
                            *p = priority;
                        }
                    }
                    Some(TorrentCommand::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(TorrentCommand::Shutdown(reply)) => {
                        self.teardown();
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.teardown();
                        return;
                    }
                },

                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    let now = Instant::now();
                    while let Some(tick) = self.timers.pop_due(now) {
                        self.on_tick(tick, now);
                    }
                }
            }
        }
    }

    fn status(&self) -> TorrentStatus {
        TorrentStatus {
            name: self.info.name.clone(),
            num_pieces: self.info.num_pieces(),
            have_pieces: self.own_bits.count() as u32,
            complete: self.is_complete(),
            connected_peers: self
                .peers
                .iter()
                .filter(|(_, p)| p.life == PeerLife::Active)
                .count(),
            downloaded: self.downloaded,
            uploaded: self.uploaded,
        }
    }

    fn on_tick(&mut self, tick: Tick, now: Instant) {
        match tick {
            Tick::Choke => {
                self.rotate_chokes(now);
                self.timers.schedule(now + choker::ROTATE_EVERY, Tick::Choke);
            }
            Tick::RequestCheck => {
                self.check_request_deadlines(now);
                self.dial_more();
                self.timers
                    .schedule(now + REQUEST_CHECK_EVERY, Tick::RequestCheck);
            }
            Tick::Sync => {
                self.chunks
                    .sync_chunks(SyncFlags::USE_TIMEOUT | SyncFlags::SLOPPY, now);
                self.timers.schedule(now + SYNC_EVERY, Tick::Sync);
            }
            Tick::Pex => {
                self.send_pex(now);
                self.timers.schedule(now + PEX_EVERY, Tick::Pex);
            }
            Tick::Cull => {
                self.peer_list
                    .cull(CullFlags::OLD | CullFlags::KEEP_INTERESTING, now);
                self.timers.schedule(now + CULL_EVERY, Tick::Cull);
            }
            Tick::Throttle => {
                self.upload_throttle.lock().unwrap().tick();
                self.download_throttle.lock().unwrap().tick();
                self.timers.schedule(now + TICK, Tick::Throttle);
            }
        }
    }

    // ------------------------------------------------------------------
    // Connections

    fn dial_more(&mut self) {
        if self.is_complete() {
            return;
        }

        while self.peers.len() < self.cfg.max_peers {
            let addr = match self.peer_list.available().pop_random() {
                Some(a) => a,
                None => return,
            };

            let list_key = match self.peer_list.connected(addr) {
                Some(k) => k,
                None => continue,
            };

            let key = self.insert_peer_state(addr, list_key, PeerLife::Handshaking);

            let ours = self.own_handshake();
            let policy = self.cfg.encryption;
            let done = self.self_cmd.clone();

            tokio::spawn(async move {
                let result = async {
                    let stream =
                        tokio::time::timeout(CONNECT_DEADLINE, TcpStream::connect(addr))
                            .await
                            .map_err(|_| "connect timed out".to_owned())?
                            .map_err(|e| e.to_string())?;
                    stream.set_nodelay(true).ok();
                    let outcome =
                        tokio::time::timeout(HANDSHAKE_DEADLINE, outgoing(stream, &ours, policy))
                            .await
                            .map_err(|_| "handshake timed out".to_owned())?
                            .map_err(|e| e.to_string())?;
                    Ok((outcome.stream, outcome.remote))
                }
                .await;

                let _ = done.send(TorrentCommand::DialFinished { key, result });
            });
        }
    }

    fn insert_peer_state(&mut self, addr: SocketAddr, list_key: PeerKey, life: PeerLife) -> PeerKey {
        self.peers.insert(PeerState {
            addr,
            life,
            cmd: None,
            bits: Bitfield::with_size(self.info.num_pieces() as usize),
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            affinity: None,
            outstanding: Vec::new(),
            snubbed: false,
            down_rate: Rate::new(),
            up_rate: Rate::new(),
            throttle_node: None,
            last_pex: None,
            list_key,
        })
    }

    fn on_dial_finished(
        &mut self,
        key: PeerKey,
        result: Result<(PeerStream<TcpStream>, Handshake), String>,
    ) {
        if !self.peers.contains(key) {
            return;
        }

        match result {
            Ok((socket, remote)) => self.activate_peer(key, socket, remote),
            Err(reason) => {
                log::debug!("Dial of {} failed: {}", self.peers[key].addr, reason);
                let peer = self.peers.remove(key);
                self.peer_list
                    .disconnected(peer.list_key, DisconnectFlags::SET_TIME, Instant::now());
                if let Some(info) = self.peer_list.get_mut(peer.list_key) {
                    info.failures += 1;
                }
            }
        }
    }

    fn adopt_incoming(
        &mut self,
        socket: PeerStream<TcpStream>,
        remote: Handshake,
        addr: SocketAddr,
    ) {
        let list_key = match self.peer_list.connected(addr) {
            Some(k) => k,
            None => {
                log::debug!("Refusing peer {}: connection cap", addr);
                return;
            }
        };

        let key = self.insert_peer_state(addr, list_key, PeerLife::Handshaking);
        self.activate_peer(key, socket, remote);
    }

    fn activate_peer(&mut self, key: PeerKey, socket: PeerStream<TcpStream>, remote: Handshake) {
        let throttle_node = self.upload_throttle.lock().unwrap().add_node();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        {
            let peer = &mut self.peers[key];
            peer.life = PeerLife::Active;
            peer.cmd = Some(cmd_tx.clone());
            peer.throttle_node = Some(throttle_node);
        }
        if let Some(info) = self.peer_list.get_mut(self.peers[key].list_key) {
            info.peer_id = Some(remote.peer_id);
        }

        let ctx = ConnContext {
            key,
            num_pieces: self.info.num_pieces() as usize,
            listen_port: self.listen_port,
            max_requests: self.cfg.max_peer_requests,
            upload_throttle: self.upload_throttle.clone(),
            throttle_node,
            events: self.events_tx.clone(),
        };

        tokio::spawn(run_peer(socket, remote, ctx, cmd_rx));

        // Opening move: our bitfield, if it says anything.
        if self.own_bits.count() > 0 {
            let _ = cmd_tx.send(PeerCommand::Bitfield(self.own_bits.clone()));
        }

        log::debug!("Peer {} active at {}", key, self.peers[key].addr);
    }

    fn send_to(&self, key: PeerKey, cmd: PeerCommand) {
        if let Some(peer) = self.peers.get(key) {
            if let Some(tx) = &peer.cmd {
                let _ = tx.send(cmd);
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer events

    fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Bitfield { key, bits } => {
                if !self.peers.contains(key) {
                    return;
                }
                // Replace, not accumulate: a repeated bitfield must not
                // inflate availability.
                for (i, had) in self.peers[key].bits.iter().enumerate() {
                    if had {
                        self.availability[i] = self.availability[i].saturating_sub(1);
                    }
                }
                for (i, has) in bits.iter().enumerate() {
                    if has {
                        self.availability[i] += 1;
                    }
                }
                self.peers[key].bits = bits;
                self.update_interest(key);
            }

            PeerEvent::Have { key, index } => {
                if !self.peers.contains(key) || index >= self.info.num_pieces() {
                    return;
                }
                if !self.peers[key].bits.get_bit(index as usize) {
                    self.peers[key].bits.set_bit(index as usize);
                    self.availability[index as usize] += 1;
                }
                self.update_interest(key);
            }

            PeerEvent::Choked { key, choked } => {
                if !self.peers.contains(key) {
                    return;
                }
                self.peers[key].peer_choking = choked;
                if choked {
                    // Outstanding requests are implicitly dropped.
                    let stalled: Vec<BlockTransfer> = self.peers[key]
                        .outstanding
                        .drain(..)
                        .map(|(t, _)| t)
                        .collect();
                    for t in stalled {
                        self.delegator.stall(key, t.piece, t.begin);
                    }
                } else {
                    self.fill_requests(key);
                }
            }

            PeerEvent::Interested { key, interested } => {
                let unchoked = self
                    .peers
                    .iter()
                    .filter(|(_, p)| !p.am_choking && p.life == PeerLife::Active)
                    .count();
                if let Some(peer) = self.peers.get_mut(key) {
                    peer.peer_interested = interested;
                    // Free slot: no reason to make them wait for the next
                    // rotation.
                    if interested && peer.am_choking && unchoked < UNCHOKE_SLOTS {
                        peer.am_choking = false;
                        if let Some(tx) = &peer.cmd {
                            let _ = tx.send(PeerCommand::Choke(false));
                        }
                    }
                }
            }

            PeerEvent::Request {
                key,
                index,
                begin,
                len,
            } => {
                self.serve_request(key, index, begin, len);
            }

            PeerEvent::Cancel { .. } => {
                // Blocks are queued whole on the connection; nothing to
                // unwind by the time a cancel arrives.
            }

            PeerEvent::Block {
                key,
                index,
                begin,
                data,
            } => {
                self.on_block(key, index, begin, data);
            }

            PeerEvent::DhtPort { key, port } => {
                if let Some(peer) = self.peers.get(key) {
                    log::trace!("Peer {} DHT port {}", peer.addr, port);
                }
            }

            PeerEvent::Pex { key, added, .. } => {
                if !self.peers.contains(key) {
                    return;
                }
                for a in added {
                    self.peer_list
                        .insert_address(SocketAddr::V4(a), InsertFlags::AVAILABLE);
                }
                self.dial_more();
            }

            PeerEvent::Closed { key, .. } => {
                self.on_peer_closed(key);
            }
        }
    }

    fn on_peer_closed(&mut self, key: PeerKey) {
        if !self.peers.contains(key) {
            return;
        }

        let peer = self.peers.remove(key);
        if let Some(node) = peer.throttle_node {
            self.upload_throttle.lock().unwrap().remove_node(node);
        }

        for (i, has) in peer.bits.iter().enumerate() {
            if has {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }

        // Their blocks return to the pool as stalled entries, not losses.
        self.delegator.cancel_peer(key);

        self.peer_list.disconnected(
            peer.list_key,
            DisconnectFlags::AVAILABLE | DisconnectFlags::SET_TIME,
            Instant::now(),
        );

        log::debug!("Peer {} gone ({} left)", peer.addr, self.peers.len());
        self.dial_more();
    }

    fn update_interest(&mut self, key: PeerKey) {
        let wanted = {
            let peer = &self.peers[key];
            peer.bits
                .iter()
                .enumerate()
                .any(|(i, has)| has && !self.own_bits.get_bit(i))
        };

        {
            let peer = &mut self.peers[key];
            if wanted != peer.am_interested {
                peer.am_interested = wanted;
                if let Some(tx) = &peer.cmd {
                    let _ = tx.send(PeerCommand::Interested(wanted));
                }
            }
        }

        if wanted && !self.peers[key].peer_choking {
            self.fill_requests(key);
        }
    }

    // ------------------------------------------------------------------
    // Downloading

    fn fill_requests(&mut self, key: PeerKey) {
        if self.is_complete() {
            return;
        }

        match self.peers.get(key) {
            Some(p) if p.life == PeerLife::Active && !p.peer_choking => {}
            _ => return,
        }

        let now = Instant::now();
        let target = {
            let rate = self.peers[key].down_rate.rate(now);
            ((rate / BLOCK_LEN as u64) as usize + MIN_PIPELINE).clamp(MIN_PIPELINE, MAX_PIPELINE)
        };

        while self.peers[key].outstanding.len() < target {
            let (bits, is_seeder, affinity) = {
                let peer = &self.peers[key];
                (peer.bits.clone(), peer.is_seeder(), peer.affinity)
            };

            let open: Vec<u32> = self.delegator.lists().iter().map(|l| l.index).collect();
            let own_bits = &self.own_bits;
            let priorities = &self.piece_priorities;
            let availability = &self.availability;
            let info = &self.info;

            let transfer = self
                .delegator
                .delegate(key, &bits, is_seeder, affinity, |class| {
                    // Rarest-first among pieces of this priority class the
                    // peer has, we lack, and nobody opened yet.
                    let mut best: Option<(u32, u32)> = None;
                    for i in 0..info.num_pieces() {
                        let idx = i as usize;
                        if own_bits.get_bit(idx)
                            || !bits.get_bit(idx)
                            || priorities[idx] != class
                            || open.contains(&i)
                        {
                            continue;
                        }
                        if best.map_or(true, |(_, avail)| availability[idx] < avail) {
                            best = Some((i, availability[idx]));
                        }
                    }
                    best.map(|(i, _)| (i, info.piece_len_at(i)))
                });

            let transfer = match transfer {
                Some(t) => t,
                None => break,
            };

            self.peers[key].affinity = Some(transfer.piece);
            self.peers[key].outstanding.push((transfer, now));
            self.send_to(
                key,
                PeerCommand::Request {
                    index: transfer.piece,
                    begin: transfer.begin,
                    len: transfer.len,
                },
            );
        }
    }

    fn on_block(&mut self, key: PeerKey, index: u32, begin: u32, data: Vec<u8>) {
        if !self.peers.contains(key) {
            return;
        }

        let now = Instant::now();
        {
            let peer = &mut self.peers[key];
            peer.outstanding
                .retain(|(t, _)| !(t.piece == index && t.begin == begin));
            peer.down_rate.insert(data.len() as u64, now);
            peer.snubbed = false;
        }
        self.downloaded += data.len() as u64;
        self.download_throttle
            .lock()
            .unwrap()
            .record(0, data.len(), now);

        let list_key = self.peers[key].list_key;
        if let Some(info) = self.peer_list.get_mut(list_key) {
            info.transferred = true;
        }

        let outcome = match self.delegator.block_finished(key, index, begin) {
            Some(o) => o,
            None => {
                // Late data for a verified piece is noise; data for a
                // piece never opened is a protocol violation.
                if (index as usize) < self.availability.len()
                    && (self.own_bits.get_bit(index as usize) || self.hashing.contains(&index))
                {
                    return;
                }
                self.close_peer(key, "unrequested piece data");
                return;
            }
        };

        if !outcome.accepted {
            return;
        }

        // The writer's bytes go through the chunk handle.
        if let Err(e) = self.write_block(index, begin, &data) {
            log::error!("Writing piece {} failed: {}", index, e);
            return;
        }

        self.peers[key].affinity = Some(index);

        for cancel in outcome.cancels {
            if let Some(peer) = self.peers.get_mut(cancel.peer) {
                peer.outstanding
                    .retain(|(t, _)| !(t.piece == cancel.piece && t.begin == cancel.begin));
            }
            self.send_to(
                cancel.peer,
                PeerCommand::Cancel {
                    index: cancel.piece,
                    begin: cancel.begin,
                    len: cancel.len,
                },
            );
        }

        if outcome.piece_complete {
            self.submit_hash(index);
        }

        self.fill_requests(key);
    }

    fn write_block(&mut self, index: u32, begin: u32, data: &[u8]) -> crate::error::Result<()> {
        if !self.handles.contains_key(&index) {
            let handle = self.chunks.get(index, GetFlags::WRITABLE)?;
            self.handles.insert(index, handle);
        }
        let handle = &self.handles[&index];
        self.chunks.write(handle, begin as usize, data)
    }

    fn submit_hash(&mut self, index: u32) {
        let handle = match self.handles.get(&index) {
            Some(h) => h,
            None => return,
        };

        log::debug!("Piece {} complete, hashing", index);
        self.hashing.insert(index);
        let chunk = self.chunks.chunk(handle);
        self.hash_queue
            .submit(self.owner, index, chunk, self.hash_tx.clone());
    }

    fn on_hash_completions(&mut self) {
        let now = Instant::now();
        for (index, digest) in self.hash_queue.completions(self.owner) {
            self.hashing.remove(&index);

            if digest[..] == *self.info.piece_hash(index) {
                self.on_piece_verified(index, now);
            } else {
                self.on_piece_corrupt(index);
            }
        }
    }

    fn on_piece_verified(&mut self, index: u32, now: Instant) {
        log::info!("Piece {} verified", index);

        self.own_bits.set_bit(index as usize);
        self.delegator.remove_list(index);

        if let Some(handle) = self.handles.remove(&index) {
            self.chunks.release(handle, ReleaseFlags::SYNC, now);
        }

        let keys: Vec<PeerKey> = self.peers.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.send_to(key, PeerCommand::Have(index));
            self.update_interest(key);
        }

        if self.is_complete() {
            log::info!("Download of {:?} complete", self.info.name);
            self.chunks
                .sync_chunks(SyncFlags::ALL | SyncFlags::FORCE, now);
        }
    }

    fn on_piece_corrupt(&mut self, index: u32) {
        log::warn!("Hash mismatch on piece {}", index);

        // Decide who pays: a seeder-originated piece blames its writers
        // wholesale, otherwise the writers holding the most blocks.
        let victims: Vec<PeerKey> = match self.delegator.list(index) {
            Some(list) if list.by_seeder => list.writers().map(|(_, p)| p).collect(),
            Some(list) => {
                let mut counts: hashbrown::HashMap<PeerKey, usize> = hashbrown::HashMap::new();
                for (_, peer) in list.writers() {
                    *counts.entry(peer).or_default() += 1;
                }
                let max = counts.values().copied().max().unwrap_or(0);
                counts
                    .into_iter()
                    .filter(|(_, c)| *c == max && max > 0)
                    .map(|(p, _)| p)
                    .collect()
            }
            None => Vec::new(),
        };

        for key in victims {
            if let Some(peer) = self.peers.get(key) {
                let list_key = peer.list_key;
                if let Some(info) = self.peer_list.get_mut(list_key) {
                    info.banned = true;
                }
            }
            self.close_peer(key, "hash mismatch");
        }

        // Wipe and retry.
        if let Some(handle) = self.handles.get(&index) {
            let _ = self.chunks.wipe(handle);
        }
        self.delegator.clear_for_retry(index);

        let keys: Vec<PeerKey> = self.peers.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.fill_requests(key);
        }
    }

    fn close_peer(&mut self, key: PeerKey, reason: &str) {
        if let Some(peer) = self.peers.get_mut(key) {
            log::debug!("Closing peer {}: {}", peer.addr, reason);
            peer.life = PeerLife::Closing;
            if let Some(tx) = peer.cmd.take() {
                let _ = tx.send(PeerCommand::Close);
            }
        }
    }

    // ------------------------------------------------------------------
    // Uploading

    fn serve_request(&mut self, key: PeerKey, index: u32, begin: u32, len: u32) {
        let peer = match self.peers.get(key) {
            Some(p) => p,
            None => return,
        };

        if peer.am_choking {
            // Requests racing our choke are dropped silently.
            return;
        }

        if index >= self.info.num_pieces()
            || !self.own_bits.get_bit(index as usize)
            || len == 0
            || len > 8 * BLOCK_LEN
            || begin as u64 + len as u64 > self.info.piece_len_at(index) as u64
        {
            self.close_peer(key, "invalid request");
            return;
        }

        let handle = match self.chunks.get(index, GetFlags::empty()) {
            Ok(h) => h,
            Err(e) => {
                log::error!("Cannot pin piece {} for upload: {}", index, e);
                return;
            }
        };

        let mut data = vec![0u8; len as usize];
        let ok = self.chunks.read(&handle, begin as usize, &mut data).is_ok();
        self.chunks
            .release(handle, ReleaseFlags::empty(), Instant::now());

        if !ok {
            return;
        }

        let now = Instant::now();
        self.uploaded += len as u64;
        if let Some(peer) = self.peers.get_mut(key) {
            peer.up_rate.insert(len as u64, now);
        }

        self.send_to(key, PeerCommand::Block { index, begin, data });
    }

    // ------------------------------------------------------------------
    // Timers

    fn rotate_chokes(&mut self, now: Instant) {
        self.choke_round += 1;
        let seeding = self.is_complete();

        let inputs: Vec<ChokeInput> = self
            .peers
            .iter_mut()
            .filter(|(_, p)| p.life == PeerLife::Active)
            .map(|(key, p)| ChokeInput {
                key,
                interested: p.peer_interested,
                snubbed: p.snubbed,
                download_rate: p.down_rate.rate(now),
                upload_rate: p.up_rate.rate(now),
            })
            .collect();

        let unchoke = choker::pick_unchoked(&inputs, UNCHOKE_SLOTS, seeding, self.choke_round);

        let keys: Vec<PeerKey> = self.peers.iter().map(|(k, _)| k).collect();
        for key in keys {
            let should_choke = !unchoke.contains(&key);
            let peer = &mut self.peers[key];
            if peer.life != PeerLife::Active {
                continue;
            }
            if peer.am_choking != should_choke {
                peer.am_choking = should_choke;
                if let Some(tx) = &peer.cmd {
                    let _ = tx.send(PeerCommand::Choke(should_choke));
                }
            }
        }
    }

    fn check_request_deadlines(&mut self, now: Instant) {
        let mut stalled: Vec<(PeerKey, BlockTransfer)> = Vec::new();

        for (key, peer) in self.peers.iter_mut() {
            let rate = peer.down_rate.rate(now).max(1024);
            let queued = peer.outstanding.len() as u64;
            let mut any = false;

            for (t, at) in &peer.outstanding {
                let deadline =
                    REQUEST_DEADLINE_FLOOR.max(Duration::from_secs(t.len as u64 * queued / rate));
                if now.duration_since(*at) > deadline {
                    stalled.push((key, *t));
                    any = true;
                }
            }

            if any {
                peer.snubbed = true;
            }
        }

        for (key, t) in stalled {
            self.delegator.stall(key, t.piece, t.begin);
        }
    }

    fn send_pex(&mut self, now: Instant) {
        let current: HashSet<SocketAddrV4> = self
            .peers
            .iter()
            .filter_map(|(_, p)| match p.addr {
                SocketAddr::V4(a) if p.life == PeerLife::Active => Some(a),
                _ => None,
            })
            .collect();

        let added: Vec<SocketAddrV4> = current.difference(&self.pex_known).copied().collect();
        let dropped: Vec<SocketAddrV4> = self.pex_known.difference(&current).copied().collect();

        let keys: Vec<PeerKey> = self.peers.iter().map(|(k, _)| k).collect();
        for key in keys {
            let (full, addr) = {
                let peer = &self.peers[key];
                if peer.life != PeerLife::Active {
                    continue;
                }
                // Full view on the first message, and again whenever a
                // cadence tick went by without one: 60 s of PEX silence
                // means the peer's picture may have drifted.
                let full = match peer.last_pex {
                    None => true,
                    Some(at) => now.duration_since(at) >= PEX_EVERY * 2,
                };
                (full, peer.addr)
            };

            let (a, d) = if full {
                let all: Vec<SocketAddrV4> = current
                    .iter()
                    .filter(|p| SocketAddr::V4(**p) != addr)
                    .copied()
                    .collect();
                (all, Vec::new())
            } else {
                (
                    added
                        .iter()
                        .filter(|p| SocketAddr::V4(**p) != addr)
                        .copied()
                        .collect(),
                    dropped.clone(),
                )
            };

            if !a.is_empty() || !d.is_empty() {
                self.send_to(key, PeerCommand::Pex { added: a, dropped: d });
                self.peers[key].last_pex = Some(now);
            }
        }

        self.pex_known = current;
    }

    // ------------------------------------------------------------------
    // Teardown

    fn teardown(&mut self) {
        log::debug!("Tearing down {:?}", self.info.name);

        let keys: Vec<PeerKey> = self.peers.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.close_peer(key, "shutting down");
        }

        // Cancel hashing for this owner; remove() waits for an in-flight
        // job to drain, so no worker reference survives this point.
        let cancelled = self.hash_queue.remove(self.owner);
        for index in cancelled {
            self.hashing.remove(&index);
        }

        // Release every pinned chunk, write everything out, unmap.
        let now = Instant::now();
        for (_, handle) in self.handles.drain() {
            self.chunks.release(handle, ReleaseFlags::SYNC, now);
        }
        self.chunks
            .sync_chunks(SyncFlags::ALL | SyncFlags::FORCE, now);
        self.chunks.clear();
    }
}

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use peer_proto::bitfield::Bitfield;
use peer_proto::buf::RecvBuffer;
use peer_proto::conn::Connection;
use peer_proto::ext::{self, ExtendedMessage, MetadataMsg, PexMessage, RemoteExtensions};
use peer_proto::handshake::Handshake;
use peer_proto::message::{self, Packet};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::delegator::PeerKey;
use crate::peer::handshake::{AsyncStream, PeerReader, PeerStream, PeerWriter};
use crate::throttle::{NodeKey, Throttle, TICK};

/// Send a keep-alive after this much write silence.
const KEEPALIVE_EVERY: Duration = Duration::from_secs(120);

/// Drop the peer after this much read silence.
const DROP_AFTER: Duration = Duration::from_secs(240);

/// Largest message we accept: a bitfield for a very large torrent.
const MAX_MESSAGE_LEN: u32 = 4 * 1024 * 1024;

/// What the connection reports up to the torrent loop.
#[derive(Debug)]
pub enum PeerEvent {
    Bitfield {
        key: PeerKey,
        bits: Bitfield,
    },
    Have {
        key: PeerKey,
        index: u32,
    },
    Choked {
        key: PeerKey,
        choked: bool,
    },
    Interested {
        key: PeerKey,
        interested: bool,
    },
    Request {
        key: PeerKey,
        index: u32,
        begin: u32,
        len: u32,
    },
    Cancel {
        key: PeerKey,
        index: u32,
        begin: u32,
        len: u32,
    },
    Block {
        key: PeerKey,
        index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    DhtPort {
        key: PeerKey,
        port: u16,
    },
    Pex {
        key: PeerKey,
        added: Vec<SocketAddrV4>,
        dropped: Vec<SocketAddrV4>,
    },
    Closed {
        key: PeerKey,
        reason: String,
    },
}

/// What the torrent loop asks the connection to do.
#[derive(Debug)]
pub enum PeerCommand {
    Have(u32),
    Bitfield(Bitfield),
    Choke(bool),
    Interested(bool),
    Request { index: u32, begin: u32, len: u32 },
    Cancel { index: u32, begin: u32, len: u32 },
    Block { index: u32, begin: u32, data: Vec<u8> },
    Pex { added: Vec<SocketAddrV4>, dropped: Vec<SocketAddrV4> },
    Close,
}

pub struct ConnContext {
    pub key: PeerKey,
    pub num_pieces: usize,
    pub listen_port: u16,
    pub max_requests: usize,
    pub upload_throttle: Arc<Mutex<Throttle>>,
    pub throttle_node: NodeKey,
    pub events: UnboundedSender<PeerEvent>,
}

enum ReadMsg {
    Keepalive,
    Message { id: u8, payload: Vec<u8> },
    Closed(String),
}

/// Drive one peer connection until it closes.
///
/// Reading happens on a helper task so the main loop can stay on
/// cancel-safe channel receives; every inbound message funnels through it
/// as a [`ReadMsg`].
pub async fn run_peer<S: AsyncStream + 'static>(
    stream: PeerStream<S>,
    remote: Handshake,
    ctx: ConnContext,
    mut commands: UnboundedReceiver<PeerCommand>,
) {
    let key = ctx.key;
    let (reader, mut writer) = stream.split();

    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
    let read_task = tokio::spawn(read_loop(reader, raw_tx));

    let mut conn = Connection::new();
    let mut remote_ext = RemoteExtensions::default();
    let mut last_heard = Instant::now();

    // BEP-10 handshake goes out first when both ends advertise it.
    if remote.extensions.supports_extended() {
        let body = ext::encode_handshake(
            ctx.listen_port,
            crate::peer::CLIENT_VERSION,
            ctx.max_requests,
            None,
        );
        conn.send_extended(0, &body);
    }

    let mut keepalive = tokio::time::interval(KEEPALIVE_EVERY);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        if let Err(e) = flush(&mut conn, &mut writer).await {
            break format!("write failed: {}", e);
        }

        tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some(ReadMsg::Keepalive) => {
                    last_heard = Instant::now();
                }
                Some(ReadMsg::Message { id, payload }) => {
                    last_heard = Instant::now();
                    match handle_message(key, &mut conn, &mut remote_ext, &ctx, id, payload) {
                        Ok(()) => {}
                        Err(reason) => break reason,
                    }
                }
                Some(ReadMsg::Closed(reason)) => break reason,
                None => break "reader gone".to_owned(),
            },

            cmd = commands.recv() => match cmd {
                Some(PeerCommand::Have(index)) => conn.send_have(index),
                Some(PeerCommand::Bitfield(bits)) => conn.send_bitfield(&bits),
                Some(PeerCommand::Choke(true)) => conn.send_choke(),
                Some(PeerCommand::Choke(false)) => conn.send_unchoke(),
                Some(PeerCommand::Interested(true)) => conn.send_interested(),
                Some(PeerCommand::Interested(false)) => conn.send_not_interested(),
                Some(PeerCommand::Request { index, begin, len }) => {
                    conn.send_request(index, begin, len)
                }
                Some(PeerCommand::Cancel { index, begin, len }) => {
                    conn.send_cancel(index, begin, len)
                }
                Some(PeerCommand::Block { index, begin, data }) => {
                    conn.send_piece_header(index, begin, data.len() as u32);
                    if let Err(e) = flush(&mut conn, &mut writer).await {
                        break format!("write failed: {}", e);
                    }
                    if let Err(e) = send_throttled(&mut writer, &ctx, &data).await {
                        break format!("write failed: {}", e);
                    }
                }
                Some(PeerCommand::Pex { added, dropped }) => {
                    if let Some(id) = remote_ext.ut_pex {
                        let msg = PexMessage { added, dropped };
                        conn.send_extended(id, &msg.encode());
                    }
                }
                Some(PeerCommand::Close) | None => break "closed by engine".to_owned(),
            },

            _ = keepalive.tick() => {
                if last_heard.elapsed() >= DROP_AFTER {
                    break "peer timed out".to_owned();
                }
                conn.send_keepalive();
            }
        }
    };

    read_task.abort();
    log::debug!("Peer {} closing: {}", key, reason);
    let _ = ctx.events.send(PeerEvent::Closed { key, reason });
}

async fn flush<S: AsyncStream>(
    conn: &mut Connection,
    writer: &mut PeerWriter<S>,
) -> std::io::Result<()> {
    let pending = conn.pending();
    if pending.is_empty() {
        return Ok(());
    }
    writer.write_all(pending).await?;
    let n = pending.len();
    conn.consume(n);
    writer.flush().await
}

/// Piece payloads pass through the upload token bucket.
async fn send_throttled<S: AsyncStream>(
    writer: &mut PeerWriter<S>,
    ctx: &ConnContext,
    data: &[u8],
) -> std::io::Result<()> {
    let mut off = 0;
    while off < data.len() {
        let grant = {
            let mut t = ctx.upload_throttle.lock().unwrap();
            t.request(ctx.throttle_node, data.len() - off)
        };

        if grant == 0 {
            tokio::time::sleep(TICK).await;
            continue;
        }

        writer.write_all(&data[off..off + grant]).await?;
        off += grant;

        let mut t = ctx.upload_throttle.lock().unwrap();
        t.record(ctx.throttle_node, grant, Instant::now());
    }
    writer.flush().await
}

fn handle_message(
    key: PeerKey,
    conn: &mut Connection,
    remote_ext: &mut RemoteExtensions,
    ctx: &ConnContext,
    id: u8,
    payload: Vec<u8>,
) -> std::result::Result<(), String> {
    let events = &ctx.events;
    let fixed = message::packet_header_len(id);
    if payload.len() < fixed {
        return Err(format!("Short payload for message {}", id));
    }

    let mut head = &payload[..];
    let packet = Packet::read(payload.len() as u32 + 1, id, &mut head);

    match packet {
        Packet::Choke => {
            conn.recv_choke();
            let _ = events.send(PeerEvent::Choked { key, choked: true });
        }
        Packet::Unchoke => {
            conn.recv_unchoke();
            let _ = events.send(PeerEvent::Choked { key, choked: false });
        }
        Packet::Interested => {
            conn.recv_interested();
            let _ = events.send(PeerEvent::Interested {
                key,
                interested: true,
            });
        }
        Packet::NotInterested => {
            conn.recv_not_interested();
            let _ = events.send(PeerEvent::Interested {
                key,
                interested: false,
            });
        }
        Packet::Have { index } => {
            conn.recv_have(index);
            let _ = events.send(PeerEvent::Have { key, index });
        }
        Packet::Bitfield { .. } => {
            if !conn.recv_bitfield(ctx.num_pieces, &payload) {
                return Err("Bitfield length mismatch".to_owned());
            }
            let _ = events.send(PeerEvent::Bitfield {
                key,
                bits: conn.bitfield().clone(),
            });
        }
        Packet::Request { index, begin, len } => {
            let _ = events.send(PeerEvent::Request {
                key,
                index,
                begin,
                len,
            });
        }
        Packet::Cancel { index, begin, len } => {
            let _ = events.send(PeerEvent::Cancel {
                key,
                index,
                begin,
                len,
            });
        }
        Packet::Piece { index, begin, .. } => {
            let _ = events.send(PeerEvent::Block {
                key,
                index,
                begin,
                data: payload[8..].to_vec(),
            });
        }
        Packet::Port { port } => {
            let _ = events.send(PeerEvent::DhtPort { key, port });
        }
        Packet::Extended { .. } => {
            handle_extended(key, conn, remote_ext, ctx, &payload)?;
        }
        Packet::Unknown { id, .. } => {
            // Unknown ids are tolerated for forward compatibility.
            log::trace!("Ignoring unknown message id {}", id);
        }
    }

    Ok(())
}

fn handle_extended(
    key: PeerKey,
    conn: &mut Connection,
    remote_ext: &mut RemoteExtensions,
    ctx: &ConnContext,
    payload: &[u8],
) -> std::result::Result<(), String> {
    let msg = ExtendedMessage::parse(payload).map_err(|e| e.to_string())?;

    if msg.is_handshake() {
        if let Some(hs) = msg.handshake() {
            log::debug!("Peer {} extensions: {:?}", key, hs);
            *remote_ext = hs;
        }
        return Ok(());
    }

    match msg.id {
        ext::local_id::UT_PEX => {
            let pex = msg.pex().map_err(|e| e.to_string())?;
            let _ = ctx.events.send(PeerEvent::Pex {
                key,
                added: pex.added,
                dropped: pex.dropped,
            });
        }
        ext::local_id::UT_METADATA => {
            // We never serve metadata; reject politely.
            if let Some(piece) = msg.body.as_dict().and_then(|d| d.get_int("piece")) {
                if let Some(id) = remote_ext.ut_metadata {
                    conn.send_extended(id, &MetadataMsg::Reject(piece as u32).encode());
                }
            }
        }
        other => {
            log::trace!("Ignoring unknown extension id {}", other);
        }
    }

    Ok(())
}

async fn read_loop<S: AsyncStream>(mut reader: PeerReader<S>, tx: UnboundedSender<ReadMsg>) {
    // Socket reads land in a cursor buffer; a readiness event may deliver
    // a partial message and the remainder arrives on a later one.
    let mut buf = RecvBuffer::with_capacity(1024);

    loop {
        let msg = match read_message(&mut reader, &mut buf).await {
            Ok(m) => m,
            Err(e) => {
                let _ = tx.send(ReadMsg::Closed(e));
                return;
            }
        };
        if tx.send(msg).is_err() {
            return;
        }
    }
}

/// Top the buffer up to `need` unread bytes.
async fn fill<S: AsyncStream>(
    reader: &mut PeerReader<S>,
    buf: &mut RecvBuffer,
    need: usize,
) -> std::result::Result<(), String> {
    while buf.unread() < need {
        let dst = buf.write_reserve(need);
        debug_assert!(!dst.is_empty());
        let n = reader.read(dst).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("connection closed".to_owned());
        }
        buf.advance_write(n);
    }
    Ok(())
}

async fn read_message<S: AsyncStream>(
    reader: &mut PeerReader<S>,
    buf: &mut RecvBuffer,
) -> std::result::Result<ReadMsg, String> {
    fill(reader, buf, 4).await?;
    let len = u32::from_be_bytes(buf.read_array::<4>());

    if len == 0 {
        return Ok(ReadMsg::Keepalive);
    }
    if len > MAX_MESSAGE_LEN {
        return Err(format!("Message of {} bytes refused", len));
    }

    fill(reader, buf, len as usize).await?;
    let id = buf.read(1)[0];
    let payload = buf.read(len as usize - 1).to_vec();

    Ok(ReadMsg::Message { id, payload })
}

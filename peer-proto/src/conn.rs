use bytes::BufMut;

use crate::bitfield::Bitfield;
use crate::message::*;

/// Per-peer protocol state: choke/interest in both directions, the remote's
/// bitfield and the outgoing byte queue.
///
/// Send methods only append to the queue; the engine drains [`pending`] into
/// the socket and acknowledges with [`consume`], so partial writes leave the
/// remainder queued.
///
/// [`pending`]: Connection::pending
/// [`consume`]: Connection::consume
pub struct Connection {
    send_buf: Vec<u8>,
    sent: usize,
    bitfield: Bitfield,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            send_buf: Vec::with_capacity(1024),
            sent: 0,
            bitfield: Bitfield::new(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn bitfield_mut(&mut self) -> &mut Bitfield {
        &mut self.bitfield
    }

    pub fn send_keepalive(&mut self) {
        self.send_buf.put_u32(0);
    }

    pub fn send_choke(&mut self) {
        self.am_choking = true;
        self.send_buf.put_u32(1);
        self.send_buf.put_u8(CHOKE);
    }

    pub fn send_unchoke(&mut self) {
        self.am_choking = false;
        self.send_buf.put_u32(1);
        self.send_buf.put_u8(UNCHOKE);
    }

    pub fn send_interested(&mut self) {
        self.am_interested = true;
        self.send_buf.put_u32(1);
        self.send_buf.put_u8(INTERESTED);
    }

    pub fn send_not_interested(&mut self) {
        self.am_interested = false;
        self.send_buf.put_u32(1);
        self.send_buf.put_u8(NOT_INTERESTED);
    }

    pub fn send_have(&mut self, index: u32) {
        self.send_buf.put_u32(5);
        self.send_buf.put_u8(HAVE);
        self.send_buf.put_u32(index);
    }

    pub fn send_bitfield(&mut self, own: &Bitfield) {
        let bytes = own.as_bytes();
        self.send_buf.put_u32(bytes.len() as u32 + 1);
        self.send_buf.put_u8(BITFIELD);
        self.send_buf.extend(bytes);
    }

    pub fn send_request(&mut self, index: u32, begin: u32, len: u32) {
        self.send_buf.put_u32(13);
        self.send_buf.put_u8(REQUEST);
        self.send_buf.put_u32(index);
        self.send_buf.put_u32(begin);
        self.send_buf.put_u32(len);
    }

    /// Write a `piece` header; the caller appends `len` payload bytes with
    /// [`send_raw`](Connection::send_raw).
    pub fn send_piece_header(&mut self, index: u32, begin: u32, len: u32) {
        self.send_buf.put_u32(9 + len);
        self.send_buf.put_u8(PIECE);
        self.send_buf.put_u32(index);
        self.send_buf.put_u32(begin);
    }

    pub fn send_raw(&mut self, data: &[u8]) {
        self.send_buf.extend(data);
    }

    pub fn send_cancel(&mut self, index: u32, begin: u32, len: u32) {
        self.send_buf.put_u32(13);
        self.send_buf.put_u8(CANCEL);
        self.send_buf.put_u32(index);
        self.send_buf.put_u32(begin);
        self.send_buf.put_u32(len);
    }

    pub fn send_port(&mut self, port: u16) {
        self.send_buf.put_u32(3);
        self.send_buf.put_u8(PORT);
        self.send_buf.put_u16(port);
    }

    pub fn send_extended(&mut self, id: u8, payload: &[u8]) {
        self.send_buf.put_u32(2 + payload.len() as u32);
        self.send_buf.put_u8(EXTENDED);
        self.send_buf.put_u8(id);
        self.send_buf.extend(payload);
    }

    /// Outgoing bytes not yet written to the socket.
    pub fn pending(&self) -> &[u8] {
        &self.send_buf[self.sent..]
    }

    /// Acknowledge that `n` pending bytes reached the socket.
    pub fn consume(&mut self, n: usize) {
        self.sent += n;
        debug_assert!(self.sent <= self.send_buf.len());
        if self.sent == self.send_buf.len() {
            self.send_buf.clear();
            self.sent = 0;
        }
    }

    /// Drain the whole outgoing queue. Test and diagnostics helper.
    pub fn take_send_buf(&mut self) -> Vec<u8> {
        self.sent = 0;
        std::mem::take(&mut self.send_buf)
    }

    pub fn recv_choke(&mut self) {
        self.peer_choking = true;
    }

    pub fn recv_unchoke(&mut self) {
        self.peer_choking = false;
    }

    pub fn recv_interested(&mut self) {
        self.peer_interested = true;
    }

    pub fn recv_not_interested(&mut self) {
        self.peer_interested = false;
    }

    pub fn recv_have(&mut self, index: u32) {
        if index as usize >= self.bitfield.len() {
            self.bitfield.resize(index as usize + 1);
        }
        self.bitfield.set_bit(index as usize);
    }

    pub fn recv_bitfield(&mut self, num_pieces: usize, payload: &[u8]) -> bool {
        self.bitfield.copy_from_slice(num_pieces, payload)
    }
}

use bytes::Buf;

pub const CHOKE: u8 = 0;
pub const UNCHOKE: u8 = 1;
pub const INTERESTED: u8 = 2;
pub const NOT_INTERESTED: u8 = 3;
pub const HAVE: u8 = 4;
pub const BITFIELD: u8 = 5;
pub const REQUEST: u8 = 6;
pub const PIECE: u8 = 7;
pub const CANCEL: u8 = 8;
pub const PORT: u8 = 9;
pub const EXTENDED: u8 = 20;

/// Bytes of fixed header following the message id, before any bulk payload.
pub fn packet_header_len(id: u8) -> usize {
    match id {
        HAVE => 4,
        PIECE => 8,
        REQUEST | CANCEL => 12,
        PORT => 2,
        _ => 0,
    }
}

/// A parsed message header. Bulk payloads (bitfield bytes, piece data,
/// extended body) stay in the receive buffer; `len` tells the caller how
/// much to consume.
#[derive(Debug, PartialEq)]
pub enum Packet {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { len: u32 },
    Request { index: u32, begin: u32, len: u32 },
    Piece { index: u32, begin: u32, len: u32 },
    Cancel { index: u32, begin: u32, len: u32 },
    Port { port: u16 },
    Extended { len: u32 },
    Unknown { id: u8, len: u32 },
}

impl Packet {
    /// Parse a message header. `len` is the wire length prefix (id byte
    /// included); `data` must hold at least `packet_header_len(id)` bytes.
    pub fn read(len: u32, id: u8, data: &mut impl Buf) -> Packet {
        match id {
            CHOKE => Packet::Choke,
            UNCHOKE => Packet::Unchoke,
            INTERESTED => Packet::Interested,
            NOT_INTERESTED => Packet::NotInterested,
            HAVE => Packet::Have {
                index: data.get_u32(),
            },
            BITFIELD => Packet::Bitfield { len: len - 1 },
            REQUEST => Packet::Request {
                index: data.get_u32(),
                begin: data.get_u32(),
                len: data.get_u32(),
            },
            PIECE => Packet::Piece {
                index: data.get_u32(),
                begin: data.get_u32(),
                len: len - 9,
            },
            CANCEL => Packet::Cancel {
                index: data.get_u32(),
                begin: data.get_u32(),
                len: data.get_u32(),
            },
            PORT => Packet::Port {
                port: data.get_u16(),
            },
            EXTENDED => Packet::Extended { len: len - 1 },
            _ => Packet::Unknown { id, len: len - 1 },
        }
    }
}

use std::net::{Ipv4Addr, SocketAddrV4};

use bencode::{DictEncoder, ValueRef};
use thiserror::Error;

pub const METADATA_PIECE_LEN: usize = 0x4000;

/// Message ids we advertise in our `m` dictionary.
pub mod local_id {
    pub const UT_METADATA: u8 = 1;
    pub const UT_PEX: u8 = 2;
}

mod msg_type {
    pub const REQUEST: i64 = 0;
    pub const DATA: i64 = 1;
    pub const REJECT: i64 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum Error {
    #[error("Unexpected EOF in extended message")]
    Eof,

    #[error("Invalid bencoded body")]
    InvalidBody,

    #[error("Missing or invalid `{0}` key")]
    MissingKey(&'static str),

    #[error("Metadata piece larger than 16 KiB")]
    PieceTooLarge,

    #[error("Unexpected metadata piece index")]
    WrongPiece,
}

/// A raw extended message: sub-id, bencoded head, trailing payload bytes.
#[derive(Debug)]
pub struct ExtendedMessage<'a> {
    pub id: u8,
    pub body: ValueRef<'a>,
    pub rest: &'a [u8],
}

impl<'a> ExtendedMessage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        let (&id, data) = data.split_first().ok_or(Error::Eof)?;
        let (body, used) = ValueRef::decode_prefix(data).map_err(|_| Error::InvalidBody)?;
        Ok(Self {
            id,
            body,
            rest: &data[used..],
        })
    }

    pub fn is_handshake(&self) -> bool {
        self.id == 0
    }

    /// Remote's handshake contents, if this is a handshake message.
    pub fn handshake(&self) -> Option<RemoteExtensions> {
        let dict = self.body.as_dict()?;
        let m = dict.get_dict("m")?;
        Some(RemoteExtensions {
            ut_metadata: m.get_int("ut_metadata").map(|v| v as u8),
            ut_pex: m.get_int("ut_pex").map(|v| v as u8),
            metadata_size: dict.get_int("metadata_size").map(|v| v as usize),
            listen_port: dict.get_int("p").map(|v| v as u16),
            max_requests: dict.get_int("reqq").map(|v| v as usize),
        })
    }

    /// Extract the payload of a `ut_metadata` DATA message for the expected
    /// piece.
    pub fn metadata_data(&self, expected_piece: u32) -> Result<&'a [u8], Error> {
        let dict = self.body.as_dict().ok_or(Error::InvalidBody)?;

        let msg_type = dict.get_int("msg_type").ok_or(Error::MissingKey("msg_type"))?;
        if msg_type != msg_type::DATA {
            return Err(Error::MissingKey("msg_type"));
        }

        let piece = dict.get_int("piece").ok_or(Error::MissingKey("piece"))?;
        if piece != expected_piece as i64 {
            return Err(Error::WrongPiece);
        }

        if self.rest.len() > METADATA_PIECE_LEN {
            return Err(Error::PieceTooLarge);
        }

        Ok(self.rest)
    }

    /// Parse a `ut_pex` message into added/dropped address deltas.
    pub fn pex(&self) -> Result<PexMessage, Error> {
        let dict = self.body.as_dict().ok_or(Error::InvalidBody)?;
        Ok(PexMessage {
            added: parse_compact_v4(dict.get_bytes("added").unwrap_or_default())?,
            dropped: parse_compact_v4(dict.get_bytes("dropped").unwrap_or_default())?,
        })
    }
}

/// Capabilities the remote announced in its extension handshake.
#[derive(Debug, Default, PartialEq)]
pub struct RemoteExtensions {
    pub ut_metadata: Option<u8>,
    pub ut_pex: Option<u8>,
    pub metadata_size: Option<usize>,
    pub listen_port: Option<u16>,
    pub max_requests: Option<usize>,
}

/// Build our extension handshake (sub-id 0) body.
pub fn encode_handshake(
    listen_port: u16,
    client_version: &str,
    max_requests: usize,
    metadata_size: Option<usize>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut dict = DictEncoder::new(&mut buf);

    let mut m = dict.insert_dict("m");
    m.insert("ut_metadata", local_id::UT_METADATA as i64);
    m.insert("ut_pex", local_id::UT_PEX as i64);
    m.finish();

    if let Some(size) = metadata_size {
        dict.insert("metadata_size", size as i64);
    }
    dict.insert("p", listen_port as i64);
    dict.insert("reqq", max_requests as i64);
    dict.insert("v", client_version);
    dict.finish();
    buf
}

/// Address deltas carried by a `ut_pex` message.
#[derive(Debug, Default, PartialEq)]
pub struct PexMessage {
    pub added: Vec<SocketAddrV4>,
    pub dropped: Vec<SocketAddrV4>,
}

impl PexMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut dict = DictEncoder::new(&mut buf);
        dict.insert("added", write_compact_v4(&self.added));
        dict.insert("dropped", write_compact_v4(&self.dropped));
        dict.finish();
        buf
    }
}

fn parse_compact_v4(data: &[u8]) -> Result<Vec<SocketAddrV4>, Error> {
    if data.len() % 6 != 0 {
        return Err(Error::InvalidBody);
    }

    Ok(data
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

fn write_compact_v4(addrs: &[SocketAddrV4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addrs.len() * 6);
    for a in addrs {
        out.extend(a.ip().octets());
        out.extend(a.port().to_be_bytes());
    }
    out
}

/// Outgoing `ut_metadata` messages.
pub enum MetadataMsg {
    Request(u32),
    Reject(u32),
    Data(u32, usize),
}

impl MetadataMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut dict = DictEncoder::new(&mut buf);
        match *self {
            MetadataMsg::Request(piece) => {
                dict.insert("msg_type", msg_type::REQUEST);
                dict.insert("piece", piece as i64);
            }
            MetadataMsg::Reject(piece) => {
                dict.insert("msg_type", msg_type::REJECT);
                dict.insert("piece", piece as i64);
            }
            MetadataMsg::Data(piece, total_size) => {
                dict.insert("msg_type", msg_type::DATA);
                dict.insert("piece", piece as i64);
                dict.insert("total_size", total_size as i64);
            }
        }
        dict.finish();
        buf
    }
}

use std::net::SocketAddr;

use bencode::{DictEncoder, ValueRef};

use crate::contact::{Contact, CompactNodes};
use crate::id::NodeId;

/// Persisted DHT state: our node id plus the contacts worth re-dialing on
/// the next start, as a bencoded dict `{nodes: n×26 bytes, own_id: 20}`.
#[derive(Debug, Default, PartialEq)]
pub struct NodeCache {
    pub own_id: NodeId,
    pub nodes: Vec<(NodeId, SocketAddr)>,
}

impl NodeCache {
    pub fn encode(&self) -> Vec<u8> {
        let mut nodes = Vec::with_capacity(self.nodes.len() * CompactNodes::ENTRY_LEN);
        for (id, addr) in &self.nodes {
            // Only IPv4 fits the 26-byte entry format.
            if addr.is_ipv4() {
                Contact::new(*id, *addr).write_compact(&mut nodes);
            }
        }

        let mut buf = Vec::new();
        let mut dict = DictEncoder::new(&mut buf);
        dict.insert("nodes", nodes);
        dict.insert("own_id", &self.own_id);
        dict.finish();
        buf
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let value = ValueRef::decode(buf)?;
        let dict = value.as_dict().ok_or_else(|| anyhow::anyhow!("Cache is not a dict"))?;

        let own_id = dict
            .get_bytes("own_id")
            .and_then(NodeId::from_bytes)
            .ok_or_else(|| anyhow::anyhow!("Missing own_id"))?;

        let nodes = CompactNodes::new(dict.get_bytes("nodes").unwrap_or_default())?
            .map(|c| (c.id, c.addr))
            .collect();

        Ok(Self { own_id, nodes })
    }
}

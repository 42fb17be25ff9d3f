use bencode::{DictEncoder, Encode};

use crate::id::NodeId;
use crate::msg::TxnId;

#[derive(Debug)]
pub struct Ping {
    pub txn_id: TxnId,
    pub id: NodeId,
}

impl Encode for Ping {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut d = DictEncoder::new(buf);

        let mut a = d.insert_dict("a");
        a.insert("id", &self.id);
        a.finish();

        d.insert("q", "ping");
        d.insert("t", self.txn_id);
        d.insert("y", "q");
    }
}

#[derive(Debug)]
pub struct FindNode {
    pub txn_id: TxnId,
    pub id: NodeId,
    pub target: NodeId,
}

impl Encode for FindNode {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut d = DictEncoder::new(buf);

        let mut a = d.insert_dict("a");
        a.insert("id", &self.id);
        a.insert("target", &self.target);
        a.finish();

        d.insert("q", "find_node");
        d.insert("t", self.txn_id);
        d.insert("y", "q");
    }
}

#[derive(Debug)]
pub struct GetPeers {
    pub txn_id: TxnId,
    pub id: NodeId,
    pub info_hash: NodeId,
}

impl Encode for GetPeers {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut d = DictEncoder::new(buf);

        let mut a = d.insert_dict("a");
        a.insert("id", &self.id);
        a.insert("info_hash", &self.info_hash);
        a.finish();

        d.insert("q", "get_peers");
        d.insert("t", self.txn_id);
        d.insert("y", "q");
    }
}

#[derive(Debug)]
pub struct AnnouncePeer<'a> {
    pub txn_id: TxnId,
    pub id: NodeId,
    pub info_hash: NodeId,
    pub implied_port: bool,
    pub port: u16,
    pub token: &'a [u8],
}

impl Encode for AnnouncePeer<'_> {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut d = DictEncoder::new(buf);

        let mut a = d.insert_dict("a");
        a.insert("id", &self.id);
        a.insert("implied_port", self.implied_port as i64);
        a.insert("info_hash", &self.info_hash);
        a.insert("port", self.port as i64);
        a.insert("token", self.token);
        a.finish();

        d.insert("q", "announce_peer");
        d.insert("t", self.txn_id);
        d.insert("y", "q");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ascii_escape(buf: &[u8]) -> String {
        use std::ascii::escape_default;
        buf.iter()
            .flat_map(|&c| escape_default(c))
            .map(char::from)
            .collect()
    }

    #[track_caller]
    fn assert_encodes(msg: impl Encode, expected: &[u8]) {
        let encoded = msg.encode_to_vec();
        assert_eq!(
            encoded,
            expected,
            "\nExpected : {}\nActual   : {}",
            ascii_escape(expected),
            ascii_escape(&encoded)
        );
    }

    #[test]
    fn ping() {
        assert_encodes(
            Ping {
                txn_id: TxnId(10),
                id: NodeId::all(1),
            },
            b"d1:ad2:id20:\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01e1:q4:ping1:t1:\n1:y1:qe",
        );
    }

    #[test]
    fn find_node() {
        assert_encodes(
            FindNode {
                txn_id: TxnId(10),
                id: NodeId::all(1),
                target: NodeId::all(2),
            },
            b"d1:ad2:id20:\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x016:target20:\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02e1:q9:find_node1:t1:\n1:y1:qe",
        );
    }

    #[test]
    fn get_peers() {
        assert_encodes(
            GetPeers {
                txn_id: TxnId(10),
                id: NodeId::all(1),
                info_hash: NodeId::all(2),
            },
            b"d1:ad2:id20:\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x019:info_hash20:\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02e1:q9:get_peers1:t1:\n1:y1:qe",
        );
    }

    #[test]
    fn announce_peer() {
        assert_encodes(
            AnnouncePeer {
                txn_id: TxnId(10),
                id: NodeId::all(1),
                info_hash: NodeId::all(2),
                implied_port: false,
                port: 5000,
                token: &[0, 1, 2],
            },
            b"d1:ad2:id20:\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x0112:implied_porti0e9:info_hash20:\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x02\x024:porti5000e5:token3:\x00\x01\x02e1:q13:announce_peer1:t1:\n1:y1:qe",
        );
    }
}

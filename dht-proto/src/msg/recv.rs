use anyhow::{bail, Context};
use bencode::{Dict, ValueRef};

use crate::id::NodeId;
use crate::msg::TxnId;

/// A parsed incoming datagram.
#[derive(Debug)]
pub enum Msg<'a> {
    Query(Query<'a>),
    Response(Response<'a>),
    Error(ErrorResponse<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

/// An incoming query. The transaction id is the remote's and is echoed
/// verbatim in our reply, whatever its length.
#[derive(Debug)]
pub struct Query<'a> {
    pub txn: &'a [u8],
    pub id: NodeId,
    pub kind: QueryKind,
    pub args: Dict<'a>,
}

/// A reply to one of our queries; the txn id is one of ours.
#[derive(Debug)]
pub struct Response<'a> {
    pub txn_id: TxnId,
    pub id: NodeId,
    pub body: Dict<'a>,
}

#[derive(Debug)]
pub struct ErrorResponse<'a> {
    pub txn_id: TxnId,
    pub code: i64,
    pub message: &'a str,
}

impl<'a> Msg<'a> {
    pub fn parse(buf: &'a [u8]) -> anyhow::Result<Msg<'a>> {
        let value = ValueRef::decode(buf)?;
        let dict = value.as_dict().context("Message is not a dict")?;

        let txn = dict.get_bytes("t").context("Missing `t`")?;

        match dict.get_bytes("y").context("Missing `y`")? {
            b"q" => {
                let kind = match dict.get_bytes("q").context("Missing `q`")? {
                    b"ping" => QueryKind::Ping,
                    b"find_node" => QueryKind::FindNode,
                    b"get_peers" => QueryKind::GetPeers,
                    b"announce_peer" => QueryKind::AnnouncePeer,
                    other => bail!("Unknown query: {:?}", String::from_utf8_lossy(other)),
                };

                let args = dict.get_dict("a").context("Missing `a`")?.clone();
                let id = args
                    .get_bytes("id")
                    .and_then(NodeId::from_bytes)
                    .context("Missing or invalid `id`")?;

                Ok(Msg::Query(Query {
                    txn,
                    id,
                    kind,
                    args,
                }))
            }
            b"r" => {
                let txn_id = TxnId::from_bytes(txn).context("Foreign txn id")?;
                let body = dict.get_dict("r").context("Missing `r`")?.clone();
                let id = body
                    .get_bytes("id")
                    .and_then(NodeId::from_bytes)
                    .context("Missing or invalid `id`")?;

                Ok(Msg::Response(Response { txn_id, id, body }))
            }
            b"e" => {
                let txn_id = TxnId::from_bytes(txn).context("Foreign txn id")?;
                let list = dict.get_list("e").context("Missing `e`")?;
                let code = list.first().and_then(|v| v.as_int()).unwrap_or(0);
                let message = list.get(1).and_then(|v| v.as_str()).unwrap_or("");

                Ok(Msg::Error(ErrorResponse {
                    txn_id,
                    code,
                    message,
                }))
            }
            other => bail!("Unknown message type: {:?}", String::from_utf8_lossy(other)),
        }
    }
}

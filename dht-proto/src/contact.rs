use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use crate::id::NodeId;

/// A bad node: never replied, or failed this many queries in a row.
pub const MAX_FAIL_COUNT: u8 = 5;

/// A node that replied this recently counts as good.
const GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Derived node standing, per the mainline rules: good nodes replied
/// within the last 15 minutes, questionable ones are unverified or went
/// silent, bad ones failed repeatedly or never answered a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Good,
    Questionable,
    Bad,
}

/// A routing-table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// `None` until we hear from the node at all.
    timeout_count: Option<u8>,
    last_replied: Option<Instant>,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            timeout_count: None,
            last_replied: None,
        }
    }

    pub fn liveness(&self, now: Instant) -> Liveness {
        if self.is_bad() {
            return Liveness::Bad;
        }

        match self.last_replied {
            Some(t) if now.duration_since(t) < GOOD_WINDOW => Liveness::Good,
            // Replied once, silent since.
            Some(_) => Liveness::Questionable,
            // Queried and never answered.
            None if self.fail_count() > 0 => Liveness::Bad,
            // Heard about, not yet verified.
            None => Liveness::Questionable,
        }
    }

    pub fn write_compact(&self, buf: &mut Vec<u8>) {
        buf.extend(&self.id[..]);
        write_compact_addr(buf, self.addr);
    }

    pub fn fail_count(&self) -> u8 {
        self.timeout_count.unwrap_or(0)
    }

    pub fn failed(&self) -> bool {
        self.fail_count() > 0
    }

    pub fn is_bad(&self) -> bool {
        self.fail_count() >= MAX_FAIL_COUNT
    }

    pub fn is_pinged(&self) -> bool {
        self.timeout_count.is_some()
    }

    pub fn set_pinged(&mut self) {
        if self.timeout_count.is_none() {
            self.timeout_count = Some(0);
        }
    }

    pub fn timed_out(&mut self) {
        if let Some(c) = &mut self.timeout_count {
            *c = c.saturating_add(1);
        } else {
            self.timeout_count = Some(1);
        }
    }

    /// Condemn the node outright (wrong-id reply).
    pub fn invalidate(&mut self) {
        self.timeout_count = Some(MAX_FAIL_COUNT);
    }

    pub fn set_confirmed(&mut self, now: Instant) {
        self.timeout_count = Some(0);
        self.last_replied = Some(now);
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.timeout_count, Some(0))
    }

    pub fn last_replied(&self) -> Option<Instant> {
        self.last_replied
    }
}

pub fn write_compact_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(a) => {
            buf.extend(a.ip().octets());
            buf.extend(a.port().to_be_bytes());
        }
        SocketAddr::V6(a) => {
            buf.extend(a.ip().octets());
            buf.extend(a.port().to_be_bytes());
        }
    }
}

/// Iterator over 26-byte compact node entries (20-byte id, IPv4, port).
pub struct CompactNodes<'a> {
    buf: &'a [u8],
}

impl<'a> CompactNodes<'a> {
    pub const ENTRY_LEN: usize = 26;

    pub fn new(buf: &'a [u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            buf.len() % Self::ENTRY_LEN == 0,
            "Compact node list length must be a multiple of {}, got {}",
            Self::ENTRY_LEN,
            buf.len()
        );
        Ok(Self { buf })
    }
}

impl Iterator for CompactNodes<'_> {
    type Item = Contact;

    fn next(&mut self) -> Option<Contact> {
        if self.buf.is_empty() {
            return None;
        }

        let (entry, rest) = self.buf.split_at(Self::ENTRY_LEN);
        self.buf = rest;

        let id = NodeId::from_bytes(&entry[..20]).unwrap();
        let ip = Ipv4Addr::new(entry[20], entry[21], entry[22], entry[23]);
        let port = u16::from_be_bytes([entry[24], entry[25]]);

        Some(Contact::new(id, SocketAddrV4::new(ip, port).into()))
    }
}

/// Parse a 6-byte compact peer entry from a `values` list.
pub fn parse_compact_peer(buf: &[u8]) -> Option<SocketAddr> {
    if buf.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let port = u16::from_be_bytes([buf[4], buf[5]]);
    Some(SocketAddrV4::new(ip, port).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_roundtrip() {
        let c = Contact::new(
            NodeId::all(7),
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 6881).into(),
        );

        let mut buf = Vec::new();
        c.write_compact(&mut buf);
        assert_eq!(buf.len(), CompactNodes::ENTRY_LEN);

        let parsed: Vec<Contact> = CompactNodes::new(&buf).unwrap().collect();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, c.id);
        assert_eq!(parsed[0].addr, c.addr);
    }

    #[test]
    fn compact_rejects_partial_entries() {
        assert!(CompactNodes::new(&[0; 25]).is_err());
        assert!(CompactNodes::new(&[0; 27]).is_err());
        assert!(CompactNodes::new(&[]).unwrap().next().is_none());
    }

    #[test]
    fn failure_accounting() {
        let mut c = Contact::new(NodeId::all(1), ([1, 2, 3, 4], 1).into());
        assert!(!c.is_pinged());
        assert!(!c.failed());

        c.timed_out();
        assert!(c.failed());
        assert!(!c.is_bad());

        for _ in 0..4 {
            c.timed_out();
        }
        assert!(c.is_bad());

        c.set_confirmed(Instant::now());
        assert!(c.is_confirmed());
        assert!(!c.is_bad());
    }

    #[test]
    fn liveness_tiers() {
        let t0 = Instant::now();

        // Heard about but never verified.
        let mut c = Contact::new(NodeId::all(1), ([1, 2, 3, 4], 1).into());
        assert_eq!(c.liveness(t0), Liveness::Questionable);

        // A reply makes it good for 15 minutes, questionable after.
        c.set_confirmed(t0);
        assert_eq!(c.liveness(t0), Liveness::Good);
        assert_eq!(
            c.liveness(t0 + Duration::from_secs(14 * 60)),
            Liveness::Good
        );
        assert_eq!(
            c.liveness(t0 + Duration::from_secs(16 * 60)),
            Liveness::Questionable
        );

        // Queried but never answered.
        let mut silent = Contact::new(NodeId::all(2), ([1, 2, 3, 5], 1).into());
        silent.timed_out();
        assert_eq!(silent.liveness(t0), Liveness::Bad);

        // Repeated failures condemn even a once-good node.
        for _ in 0..5 {
            c.timed_out();
        }
        assert_eq!(c.liveness(t0), Liveness::Bad);
    }

    #[test]
    fn peer_entry() {
        assert_eq!(
            parse_compact_peer(&[127, 0, 0, 1, 0x1a, 0xe1]),
            Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881).into())
        );
        assert_eq!(parse_compact_peer(&[1, 2, 3]), None);
    }
}

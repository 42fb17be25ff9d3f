use thiserror::Error;

use crate::{Extensions, InfoHash, PeerId};

pub const PROTOCOL: &[u8; 20] = b"\x13BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// The fixed 68-byte handshake frame.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub extensions: Extensions,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum Error {
    #[error("Invalid handshake length")]
    Invalid,

    #[error("Protocol string mismatch")]
    Protocol,

    #[error("Infohash mismatch")]
    Infohash,

    #[error("Connected to ourselves")]
    OwnPeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            extensions: Extensions::default(),
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0; HANDSHAKE_LEN];
        buf[..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.extensions.0);
        buf[28..48].copy_from_slice(&self.info_hash.0);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse and validate the remote's handshake against our own.
    ///
    /// Rejects a protocol mismatch, a foreign info-hash, and a connection
    /// back to ourselves.
    pub fn read(&self, buf: &[u8]) -> Result<Handshake, Error> {
        log::trace!("Read handshake message");

        if buf.len() != HANDSHAKE_LEN {
            return Err(Error::Invalid);
        }

        if &buf[..20] != PROTOCOL {
            return Err(Error::Protocol);
        }

        let mut extensions = Extensions::default();
        extensions.0.copy_from_slice(&buf[20..28]);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let info_hash = InfoHash(info_hash);

        if info_hash != self.info_hash {
            return Err(Error::Infohash);
        }

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        if peer_id == self.peer_id {
            return Err(Error::OwnPeerId);
        }

        Ok(Handshake {
            extensions,
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let ours = Handshake::new(InfoHash([1; 20]), [2; 20]);
        let theirs = Handshake::new(InfoHash([1; 20]), [3; 20]);
        let parsed = ours.read(&theirs.to_bytes()).unwrap();
        assert_eq!(parsed.info_hash, InfoHash([1; 20]));
        assert_eq!(parsed.peer_id, [3; 20]);
    }

    #[test]
    fn layout() {
        let h = Handshake::new(InfoHash([1; 20]), [2; 20]);
        let b = h.to_bytes();
        assert_eq!(&b[..20], PROTOCOL);
        assert_eq!(b[20..28], [0; 8]);
        assert!(b[28..48].iter().all(|&x| x == 1));
        assert!(b[48..68].iter().all(|&x| x == 2));
    }

    #[test]
    fn infohash_mismatch() {
        let ours = Handshake::new(InfoHash([1; 20]), [2; 20]);
        let theirs = Handshake::new(InfoHash([9; 20]), [3; 20]);
        assert_eq!(ours.read(&theirs.to_bytes()), Err(Error::Infohash));
    }

    #[test]
    fn self_connect_rejected() {
        let ours = Handshake::new(InfoHash([1; 20]), [2; 20]);
        assert_eq!(ours.read(&ours.to_bytes()), Err(Error::OwnPeerId));
    }

    #[test]
    fn protocol_mismatch() {
        let ours = Handshake::new(InfoHash([1; 20]), [2; 20]);
        assert_eq!(ours.read(&[0; 68]), Err(Error::Protocol));
    }

    #[test]
    fn wrong_length() {
        let ours = Handshake::new(InfoHash([1; 20]), [2; 20]);
        assert_eq!(ours.read(&[0; 10]), Err(Error::Invalid));
    }
}

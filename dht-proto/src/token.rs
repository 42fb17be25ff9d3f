use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use sha1::{Digest, Sha1};

use crate::contact::write_compact_addr;

pub const TOKEN_LEN: usize = 8;

const ROTATE_EVERY: Duration = Duration::from_secs(15 * 60);

/// Announce-token issuer.
///
/// A token is the first 8 bytes of `SHA1(secret ‖ compact-address)`. The
/// secret rotates every 15 minutes and the previous secret stays valid, so
/// a token is accepted between 15 and 30 minutes after issue depending on
/// rotation phase.
pub struct TokenStore {
    current: [u8; 16],
    previous: [u8; 16],
    rotated_at: Instant,
}

impl TokenStore {
    pub fn new(now: Instant) -> Self {
        let mut rng = rand::thread_rng();
        let mut current = [0; 16];
        let mut previous = [0; 16];
        rng.fill(&mut current);
        rng.fill(&mut previous);
        Self {
            current,
            previous,
            rotated_at: now,
        }
    }

    /// Rotate if the current secret is older than 15 minutes. Driven from
    /// the maintenance tick.
    pub fn maybe_rotate(&mut self, now: Instant) {
        while now.duration_since(self.rotated_at) >= ROTATE_EVERY {
            self.previous = self.current;
            rand::thread_rng().fill(&mut self.current);
            self.rotated_at += ROTATE_EVERY;
            log::debug!("Rotated announce token secret");
        }
    }

    pub fn make_token(&self, addr: SocketAddr) -> [u8; TOKEN_LEN] {
        hash_token(&self.current, addr)
    }

    /// Accept tokens derived from the current or the previous secret.
    pub fn is_valid(&self, addr: SocketAddr, token: &[u8]) -> bool {
        token == hash_token(&self.current, addr)
            || token == hash_token(&self.previous, addr)
    }
}

fn hash_token(secret: &[u8; 16], addr: SocketAddr) -> [u8; TOKEN_LEN] {
    let mut compact = Vec::with_capacity(18);
    write_compact_addr(&mut compact, addr);

    let mut h = Sha1::new();
    h.update(secret);
    h.update(&compact);
    let digest = h.finalize();

    let mut out = [0; TOKEN_LEN];
    out.copy_from_slice(&digest[..TOKEN_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        ([1, 2, 3, last], 6881).into()
    }

    #[test]
    fn token_bound_to_address() {
        let store = TokenStore::new(Instant::now());
        let token = store.make_token(addr(1));
        assert!(store.is_valid(addr(1), &token));
        assert!(!store.is_valid(addr(2), &token));
        assert!(!store.is_valid(addr(1), b"bogus678"));
    }

    #[test]
    fn acceptance_window() {
        let t0 = Instant::now();
        let mut store = TokenStore::new(t0);
        let token = store.make_token(addr(1));

        let minute = Duration::from_secs(60);

        // Just before the first rotation.
        store.maybe_rotate(t0 + 15 * minute - Duration::from_secs(1));
        assert!(store.is_valid(addr(1), &token));

        // After one rotation the previous secret still matches.
        store.maybe_rotate(t0 + 15 * minute);
        assert!(store.is_valid(addr(1), &token));
        store.maybe_rotate(t0 + 30 * minute - Duration::from_secs(1));
        assert!(store.is_valid(addr(1), &token));

        // After the second rotation the token is gone.
        store.maybe_rotate(t0 + 30 * minute + Duration::from_secs(1));
        assert!(!store.is_valid(addr(1), &token));
    }

    #[test]
    fn new_tokens_issued_after_rotation() {
        let t0 = Instant::now();
        let mut store = TokenStore::new(t0);
        let old = store.make_token(addr(1));

        store.maybe_rotate(t0 + Duration::from_secs(16 * 60));
        let new = store.make_token(addr(1));
        assert_ne!(old, new);
        assert!(store.is_valid(addr(1), &old));
        assert!(store.is_valid(addr(1), &new));
    }
}

//! Message Stream Encryption primitives.
//!
//! Key exchange is Diffie-Hellman over the 768-bit MODP group with
//! generator 2; the stream cipher is RC4 with the first 1024 keystream
//! bytes discarded on both directions. The driving handshake lives in the
//! engine; everything here is pure computation over byte buffers.

use num_bigint::BigUint;
use rand::Rng;
use sha1::{Digest, Sha1};

/// DH public key / shared secret length on the wire.
pub const KEY_LEN: usize = 96;
/// Maximum random padding after the public key and around the sync hashes.
pub const MAX_PAD_LEN: usize = 512;
/// Verification constant, sent encrypted to prove key agreement.
pub const VC: [u8; 8] = [0; 8];

pub const CRYPTO_PLAIN: u32 = 0x01;
pub const CRYPTO_RC4: u32 = 0x02;

const DH_PRIME: [u8; KEY_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2,
    0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67,
    0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e,
    0x34, 0x04, 0xdd, 0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5,
    0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x3a, 0x36, 0x20, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

fn prime() -> BigUint {
    BigUint::from_bytes_be(&DH_PRIME)
}

/// An ephemeral DH key pair.
pub struct DhKey {
    private: BigUint,
    public: [u8; KEY_LEN],
}

impl DhKey {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let mut secret = [0u8; 20];
        rng.fill(&mut secret[..]);
        let private = BigUint::from_bytes_be(&secret);
        let public = BigUint::from(2u8).modpow(&private, &prime());
        Self {
            private,
            public: to_fixed(&public),
        }
    }

    pub fn public_bytes(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    /// `S = Y^x mod p`, left-padded to 96 bytes.
    pub fn shared_secret(&self, peer_public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let peer = BigUint::from_bytes_be(peer_public);
        to_fixed(&peer.modpow(&self.private, &prime()))
    }
}

fn to_fixed(value: &BigUint) -> [u8; KEY_LEN] {
    let bytes = value.to_bytes_be();
    let mut out = [0; KEY_LEN];
    out[KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

pub fn sha1_pair(prefix: &[u8], data: &[u8]) -> [u8; 20] {
    let mut h = Sha1::new();
    h.update(prefix);
    h.update(data);
    h.finalize().into()
}

/// `SHA1('req1' ‖ S)` — the plaintext resynchronization mark.
pub fn req1_hash(secret: &[u8; KEY_LEN]) -> [u8; 20] {
    sha1_pair(b"req1", secret)
}

/// `SHA1('req2' ‖ SKEY) xor SHA1('req3' ‖ S)` — identifies the torrent
/// without revealing it to a passive observer.
pub fn req2_xor_req3(info_hash: &[u8; 20], secret: &[u8; KEY_LEN]) -> [u8; 20] {
    xor20(&sha1_pair(b"req2", info_hash), &sha1_pair(b"req3", secret))
}

pub fn xor20(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Per-direction RC4 keys. Returns `(key_a, key_b)`; the initiator encrypts
/// with `key_a` and decrypts with `key_b`, the receiver the other way
/// around.
pub fn derive_keys(secret: &[u8; KEY_LEN], info_hash: &[u8; 20]) -> ([u8; 20], [u8; 20]) {
    let mut joined = Vec::with_capacity(KEY_LEN + 20);
    joined.extend_from_slice(secret);
    joined.extend_from_slice(info_hash);
    (sha1_pair(b"keyA", &joined), sha1_pair(b"keyB", &joined))
}

/// RC4 keystream state.
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, slot) in s.iter_mut().enumerate() {
            *slot = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256usize {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
            *byte ^= self.s[k as usize];
        }
    }

    pub fn discard(&mut self, count: usize) {
        let mut sink = [0u8; 64];
        let mut left = count;
        while left > 0 {
            let n = left.min(sink.len());
            self.apply(&mut sink[..n]);
            left -= n;
        }
    }
}

/// Both directions of an established RC4 stream.
pub struct CipherPair {
    enc: Rc4,
    dec: Rc4,
}

impl CipherPair {
    /// Build the pair, discarding the first 1024 keystream bytes each way.
    pub fn new(enc_key: &[u8; 20], dec_key: &[u8; 20]) -> Self {
        let mut enc = Rc4::new(enc_key);
        let mut dec = Rc4::new(dec_key);
        enc.discard(1024);
        dec.discard(1024);
        Self { enc, dec }
    }

    /// Take over streams at arbitrary positions (handshake leftovers).
    pub fn from_streams(enc: Rc4, dec: Rc4) -> Self {
        Self { enc, dec }
    }

    /// Split into `(encrypt, decrypt)` streams so the two transfer
    /// directions can live on separate halves of a connection.
    pub fn into_parts(self) -> (Rc4, Rc4) {
        (self.enc, self.dec)
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.enc.apply(data);
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.dec.apply(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn rc4_known_vector() {
        // RFC 6229 style check: key "Key", plaintext "Plaintext".
        let mut rc4 = Rc4::new(b"Key");
        let mut data = *b"Plaintext";
        rc4.apply(&mut data);
        assert_eq!(data, [0xbb, 0xf3, 0x16, 0xe8, 0xd9, 0x40, 0xaf, 0x0a, 0xd3]);
    }

    #[test]
    fn rc4_discard_matches_contiguous_apply() {
        let mut a = Rc4::new(b"somekey");
        let mut b = Rc4::new(b"somekey");

        let mut skipped = [0u8; 100];
        a.apply(&mut skipped);
        b.discard(100);

        let mut x = [1u8; 32];
        let mut y = [1u8; 32];
        a.apply(&mut x);
        b.apply(&mut y);
        assert_eq!(x, y);
    }

    #[test]
    fn cipher_pair_roundtrip() {
        let key = [7u8; 20];
        let mut ours = CipherPair::new(&key, &key);
        let mut theirs = CipherPair::new(&key, &key);

        let mut data = b"hello torrent".to_vec();
        ours.encrypt(&mut data);
        assert_ne!(&data, b"hello torrent");
        theirs.decrypt(&mut data);
        assert_eq!(&data, b"hello torrent");
    }

    #[test]
    fn dh_agreement() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = DhKey::generate(&mut rng);
        let b = DhKey::generate(&mut rng);
        assert_eq!(
            a.shared_secret(b.public_bytes()),
            b.shared_secret(a.public_bytes())
        );
    }

    #[test]
    fn key_schedule_is_symmetric() {
        let secret = [3u8; KEY_LEN];
        let info_hash = [9u8; 20];
        let (key_a, key_b) = derive_keys(&secret, &info_hash);
        assert_ne!(key_a, key_b);

        // req2 xor req3 unmasks back to req2 given req3.
        let masked = req2_xor_req3(&info_hash, &secret);
        let req3 = sha1_pair(b"req3", &secret);
        assert_eq!(xor20(&masked, &req3), sha1_pair(b"req2", &info_hash));
    }
}

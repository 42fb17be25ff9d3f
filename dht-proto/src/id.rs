use std::fmt;
use std::ops::{BitXor, BitXorAssign, Deref, DerefMut};

use bencode::Encode;
use data_encoding::HEXLOWER_PERMISSIVE as hex;
use rand::Rng;

/// 160-bit node identifier / info-hash in the DHT id space.
#[derive(Copy, Clone, Default, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct NodeId([u8; 20]);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex.encode(&self.0))
    }
}

impl NodeId {
    pub const LEN: usize = 20;

    pub const fn new() -> Self {
        Self([0; 20])
    }

    pub const fn all(b: u8) -> Self {
        Self([b; 20])
    }

    pub fn gen() -> Self {
        let mut id = Self::new();
        rand::thread_rng().fill(&mut id.0[..]);
        id
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::LEN {
            return None;
        }
        let mut id = Self::new();
        id.0.copy_from_slice(buf);
        Some(id)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        for (i, b) in self.0.iter().enumerate() {
            if *b != 0 {
                return i * 8 + b.leading_zeros() as usize;
            }
        }
        160
    }

    /// Leading zeros of `self XOR other` — the log-distance bucket index.
    pub fn xor_leading_zeros(&self, other: &Self) -> usize {
        (*self ^ *other).leading_zeros()
    }

    /// A random id at the given log-distance from `root`, used to refresh
    /// the bucket covering that distance.
    pub fn gen_at_distance(root: &NodeId, bucket_idx: usize) -> Self {
        let mut delta = Self::gen().mask_leading_zeros(bucket_idx);
        if bucket_idx < 160 {
            // Pin the top bit of the range so the distance is exact.
            delta.0[bucket_idx / 8] |= 0x80 >> (bucket_idx % 8);
        }
        *root ^ delta
    }

    fn mask_leading_zeros(mut self, bits: usize) -> Self {
        if bits >= 160 {
            return Self::new();
        }
        let bytes = bits / 8;
        let rem = bits % 8;
        self.0[..bytes].fill(0);
        self.0[bytes] &= 0xff >> rem;
        self
    }
}

impl From<[u8; 20]> for NodeId {
    fn from(buf: [u8; 20]) -> Self {
        Self(buf)
    }
}

impl Deref for NodeId {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for NodeId {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Encode for NodeId {
    fn encode(&self, buf: &mut Vec<u8>) {
        bencode::encode_bytes(buf, self.0);
    }
}

impl BitXorAssign for NodeId {
    fn bitxor_assign(&mut self, rhs: NodeId) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(mut self, rhs: NodeId) -> NodeId {
        self ^= rhs;
        self
    }
}

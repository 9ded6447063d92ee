//! 160-bit Kademlia node identifier and the XOR distance metric.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const KEY_BITS: usize = 160;
pub const KEY_BYTES: usize = KEY_BITS / 8;

/// Opaque 160-bit identifier. Construction is total: any byte slice is
/// truncated or zero-padded on the right to [`KEY_BYTES`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; KEY_BYTES]);

impl NodeId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; KEY_BYTES];
        let n = bytes.len().min(KEY_BYTES);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self(buf)
    }

    /// Derives an id from an arbitrary string, taking the leading
    /// [`KEY_BYTES`] of its SHA-256 digest (a 256-bit hash truncated to
    /// 160 bits, since this crate's dependency stack does not carry SHA-1).
    pub fn from_str_digest(s: &str) -> Self {
        let digest = Sha256::digest(s.as_bytes());
        Self::from_bytes(&digest)
    }

    pub fn random() -> Self {
        let mut buf = [0u8; KEY_BYTES];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut buf);
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Self::from_bytes(&bytes))
    }

    /// XOR distance to another id, as a same-width byte array interpreted
    /// as a big-endian integer.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; KEY_BYTES];
        for i in 0..KEY_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// XOR distance between two [`NodeId`]s, ordered as a big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Distance([u8; KEY_BYTES]);

impl Distance {
    pub fn zero() -> Self {
        Self([0u8; KEY_BYTES])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Index (0-indexed, 0..=159) of the highest set bit, or 0 if the
    /// distance is zero. This is the bucket index a peer at this distance
    /// belongs in.
    pub fn bit_length(&self) -> usize {
        for (i, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                let leading = byte.leading_zeros() as usize;
                return (KEY_BYTES - i) * 8 - leading;
            }
        }
        0
    }

    /// Bucket index this distance falls into, per §4.1: `bit_length(d) - 1`,
    /// folded to 0 for a zero distance. Range is 0..=159, matching the
    /// bucket ranges a `RoutingTable` actually partitions the space into.
    pub fn bucket_index(&self) -> usize {
        self.bit_length().saturating_sub(1)
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric_and_zero_for_self() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&a), Distance::zero());
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn xor_triangle_identity_holds() {
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();
        // distance(a,c) == distance(a,b) XOR distance(b,c), bytewise.
        let ac = a.distance(&c);
        let ab = a.distance(&b);
        let bc = b.distance(&c);
        let mut xored = [0u8; KEY_BYTES];
        for i in 0..KEY_BYTES {
            xored[i] = ab.0[i] ^ bc.0[i];
        }
        assert_eq!(ac.0, xored);
    }

    #[test]
    fn bit_length_of_zero_is_zero() {
        assert_eq!(Distance::zero().bit_length(), 0);
    }

    #[test]
    fn bit_length_of_one_is_one() {
        let mut bytes = [0u8; KEY_BYTES];
        bytes[KEY_BYTES - 1] = 1;
        assert_eq!(Distance(bytes).bit_length(), 1);
    }

    #[test]
    fn hex_round_trips() {
        let a = NodeId::random();
        assert_eq!(NodeId::from_hex(&a.to_hex()).unwrap(), a);
    }
}

//! # Node Identifiers and the XOR Metric
//!
//! Identifiers are fixed-width 20-byte opaque strings (160 bits), shared by
//! node identities and store keys. Distance between two identifiers is their
//! bitwise XOR compared as a big-endian unsigned integer; the routing table
//! groups peers by the index of the highest-order differing bit.
//!
//! At the user boundary identifiers travel as base58 strings; internally
//! they are always raw byte arrays.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DhtError;

/// Identifier width in bytes. Also the k-bucket capacity (see `routing`).
pub const ID_LENGTH: usize = 20;

/// Identifier width in bits; one routing bucket per bit.
pub const ID_BITS: usize = ID_LENGTH * 8;

/// A 160-bit node identifier or store key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LENGTH]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// A fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        // The fallback only matters on targets without an entropy source.
        if getrandom::getrandom(&mut bytes).is_err() {
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = (i as u8).wrapping_mul(31).wrapping_add(17);
            }
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// Bitwise XOR distance to `other`.
    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_LENGTH] {
        let mut dist = [0u8; ID_LENGTH];
        for (i, byte) in dist.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        dist
    }

    pub fn to_base58(self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Decode a base58 string, rejecting anything that is not exactly
    /// `ID_LENGTH` bytes.
    pub fn from_base58(s: &str) -> Result<Self, DhtError> {
        let bytes = bs58::decode(s).into_vec().map_err(|_| DhtError::InvalidKey)?;
        let bytes: [u8; ID_LENGTH] = bytes.try_into().map_err(|_| DhtError::InvalidKey)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b58 = self.to_base58();
        write!(f, "NodeId({}..)", &b58[..8.min(b58.len())])
    }
}

impl From<[u8; ID_LENGTH]> for NodeId {
    fn from(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; ID_LENGTH] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Compare two distances as big-endian unsigned integers.
pub fn distance_cmp(a: &[u8; ID_LENGTH], b: &[u8; ID_LENGTH]) -> Ordering {
    for i in 0..ID_LENGTH {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Index of the highest-order bit in which `a` and `b` differ, with bit 0
/// being the most significant. Equal identifiers map to the last bucket;
/// the only caller that can hit equality is the bootstrap refresh reset.
pub fn bucket_index(a: &NodeId, b: &NodeId) -> usize {
    let dist = a.xor_distance(b);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    ID_BITS - 1
}

/// A random identifier whose bucket index relative to `origin` is exactly
/// `bucket`. Used to refresh an idle bucket by searching inside its range.
pub fn random_id_in_bucket(origin: &NodeId, bucket: usize) -> NodeId {
    debug_assert!(bucket < ID_BITS);
    let origin_bytes = origin.as_bytes();

    let mut distance = [0u8; ID_LENGTH];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = origin_bytes[i].wrapping_add((bucket.wrapping_mul(i + 1)) as u8);
        }
    }

    let byte_idx = bucket / 8;
    let bit_pos = bucket % 8;

    // Zero everything above the bucket bit, force the bucket bit itself,
    // and keep the random tail below it.
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; ID_LENGTH];
    for i in 0..ID_LENGTH {
        target[i] = origin_bytes[i] ^ distance[i];
    }
    NodeId::from_bytes(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_prefix(prefix: &[u8]) -> NodeId {
        let mut bytes = [0u8; ID_LENGTH];
        bytes[..prefix.len()].copy_from_slice(prefix);
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; ID_LENGTH]);
    }

    #[test]
    fn distance_cmp_orders_big_endian() {
        let near = [0u8; ID_LENGTH];
        let mut mid = [0u8; ID_LENGTH];
        mid[ID_LENGTH - 1] = 0xff;
        let mut far = [0u8; ID_LENGTH];
        far[0] = 1;

        assert_eq!(distance_cmp(&near, &mid), Ordering::Less);
        assert_eq!(distance_cmp(&mid, &far), Ordering::Less);
        assert_eq!(distance_cmp(&far, &far), Ordering::Equal);
    }

    #[test]
    fn bucket_index_finds_highest_differing_bit() {
        let origin = id_with_prefix(&[]);

        // Differ in the most significant bit.
        assert_eq!(bucket_index(&origin, &id_with_prefix(&[0x80])), 0);
        // Differ in the 4th bit of the first byte.
        assert_eq!(bucket_index(&origin, &id_with_prefix(&[0x10])), 3);
        // Differ only in the second byte.
        assert_eq!(bucket_index(&origin, &id_with_prefix(&[0x00, 0x01])), 15);

        // Differ only in the very last bit.
        let mut tail = [0u8; ID_LENGTH];
        tail[ID_LENGTH - 1] = 1;
        assert_eq!(bucket_index(&origin, &NodeId::from_bytes(tail)), ID_BITS - 1);
    }

    #[test]
    fn bucket_index_on_equal_ids_is_last_bucket() {
        let id = NodeId::random();
        assert_eq!(bucket_index(&id, &id), ID_BITS - 1);
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let origin = NodeId::random();
        for bucket in [0usize, 1, 7, 8, 42, 100, ID_BITS - 1] {
            let id = random_id_in_bucket(&origin, bucket);
            assert_eq!(bucket_index(&origin, &id), bucket, "bucket {bucket}");
        }
    }

    #[test]
    fn base58_round_trip() {
        let id = NodeId::random();
        let encoded = id.to_base58();
        let decoded = NodeId::from_base58(&encoded).expect("decode");
        assert_eq!(id, decoded);
    }

    #[test]
    fn base58_rejects_wrong_length_and_garbage() {
        // 8 bytes, valid base58 but too short.
        let short = bs58::encode([1u8; 8]).into_string();
        assert!(NodeId::from_base58(&short).is_err());

        // 32 bytes, too long.
        let long = bs58::encode([1u8; 32]).into_string();
        assert!(NodeId::from_base58(&long).is_err());

        // Not base58 at all.
        assert!(NodeId::from_base58("0OIl+/").is_err());
    }
}

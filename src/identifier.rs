//! Fixed-length identifiers and the XOR closeness metric.
//!
//! Node IDs and data keys share one 256-bit space so that "the nodes closest
//! to a key" is well defined. Everything else in the crate orders peers with
//! [`distance_cmp`] over [`xor_distance`].

use std::cmp::Ordering;

use iroh_blake3::Hasher;
use rand::RngCore;

/// Identifier of a node in the overlay.
pub type NodeId = [u8; 32];

/// Identifier of a stored data entry; lives in the same space as [`NodeId`].
pub type Key = [u8; 32];

/// Number of bytes in an identifier.
pub const ID_LEN: usize = 32;

fn blake3_digest(data: &[u8]) -> [u8; ID_LEN] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Derive a stable [`NodeId`] by hashing arbitrary input with BLAKE3.
///
/// ```
/// use mesh_dht::derive_node_id;
///
/// let node_id = derive_node_id(b"example-public-key-bytes");
/// assert_eq!(node_id, derive_node_id(b"example-public-key-bytes"));
/// ```
pub fn derive_node_id(seed: &[u8]) -> NodeId {
    blake3_digest(seed)
}

/// Key under which `content` is stored.
pub fn hash_content(content: &[u8]) -> Key {
    blake3_digest(content)
}

/// Draw a uniformly random identifier.
pub fn random_node_id() -> NodeId {
    let mut id = [0u8; ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Bitwise XOR of two identifiers. Symmetric, and zero only for equal ids.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    for (slot, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *slot = x ^ y;
    }
    out
}

/// Big-endian comparison of two distances.
pub fn distance_cmp(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> Ordering {
    a.iter().cmp(b.iter())
}

/// Order `a` and `b` by their distance to `reference`.
pub fn closer_to(reference: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    distance_cmp(&xor_distance(a, reference), &xor_distance(b, reference))
}

/// Find the bucket index for `other` relative to `self_id`.
///
/// The index is the position of the first differing bit (0..=255). Bucket 0
/// is the furthest half of the space; identical ids land in bucket 255.
pub fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    xor_distance(self_id, other)
        .iter()
        .enumerate()
        .find(|(_, byte)| **byte != 0)
        .map(|(index, byte)| index * 8 + byte.leading_zeros() as usize)
        .unwrap_or(ID_LEN * 8 - 1)
}

/// Short hex rendering of an identifier for log fields.
pub fn short_id(id: &NodeId) -> String {
    hex::encode(&id[..6])
}

/// Parse a full 64-character hex identifier.
pub fn parse_node_id(hex_id: &str) -> Option<NodeId> {
    let bytes = hex::decode(hex_id).ok()?;
    if bytes.len() != ID_LEN {
        return None;
    }
    let mut id = [0u8; ID_LEN];
    id.copy_from_slice(&bytes);
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with(byte: usize, value: u8) -> NodeId {
        let mut id = [0u8; ID_LEN];
        id[byte] = value;
        id
    }

    #[test]
    fn content_keys_are_blake3_digests() {
        let key = hash_content(b"document body");
        assert_eq!(key, *iroh_blake3::hash(b"document body").as_bytes());
        assert_eq!(key, derive_node_id(b"document body"));
        assert_ne!(key, hash_content(b"another body"));
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        let a = id_with(0, 0b1100_0011);
        let b = id_with(0, 0b0011_1100);
        assert_eq!(xor_distance(&a, &b), id_with(0, 0xff));
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(xor_distance(&b, &b), [0u8; ID_LEN]);
    }

    #[test]
    fn high_bytes_dominate_distance_order() {
        assert_eq!(distance_cmp(&id_with(2, 1), &id_with(2, 9)), Ordering::Less);
        assert_eq!(distance_cmp(&id_with(0, 1), &id_with(5, 0xff)), Ordering::Greater);
        assert_eq!(distance_cmp(&id_with(4, 4), &id_with(4, 4)), Ordering::Equal);
    }

    #[test]
    fn closer_to_prefers_shared_prefix() {
        let reference = [0u8; ID_LEN];
        assert_eq!(
            closer_to(&reference, &id_with(31, 0xff), &id_with(0, 0x01)),
            Ordering::Less
        );
    }

    #[test]
    fn bucket_is_position_of_first_differing_bit() {
        let origin = [0u8; ID_LEN];
        assert_eq!(bucket_index(&origin, &id_with(0, 0x80)), 0);
        assert_eq!(bucket_index(&origin, &id_with(0, 0x01)), 7);
        assert_eq!(bucket_index(&origin, &id_with(3, 0x20)), 26);
        assert_eq!(bucket_index(&origin, &origin), 255);
    }

    #[test]
    fn parse_node_id_round_trips_hex() {
        let id = derive_node_id(b"x");
        assert_eq!(parse_node_id(&hex::encode(id)), Some(id));
        assert_eq!(parse_node_id("abcd"), None);
    }
}

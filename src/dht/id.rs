//! The 160-bit Kademlia node id and the XOR distance metric over it.
//!
//! The source alternates between representing a node id as a Python `int`,
//! a hex `str`, and raw `bytes`. This implementation picks a single
//! canonical representation — a 20-byte opaque newtype — and never exposes
//! the id any other way; hex is available only through `Display`/`Debug` for
//! logging.
use std::fmt;

use rand::Rng;

/// Length in bytes of a Kademlia node id (and of an infohash).
pub const ID_LEN: usize = 20;

/// A 160-bit Kademlia node id. Equality is byte-equality; the only ordering
/// defined on ids is via [`NodeId::distance`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub const fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a node id from a 20-byte slice, returning `None` for any other
    /// length (used when parsing wire data, which may be malformed).
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ID_LEN {
            return None;
        }
        let mut buf = [0u8; ID_LEN];
        buf.copy_from_slice(bytes);
        Some(Self(buf))
    }

    /// A freshly-generated random id, used for our own local identity at
    /// startup and for `find_node` targets during bucket refresh.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let mut buf = [0u8; ID_LEN];
        rng.fill(&mut buf);
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// The 160-bit XOR distance to `other`, as an unsigned integer. The
    /// returned type orders the same way the underlying integer would:
    /// `a.distance(b) <= a.distance(c)` iff `b` is at least as close as `c`.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Crawler helper (see `enable_neighbor_spoofing`): produces
    /// `remote[0:15] ++ local[0:5]`, a fake id that makes the remote node
    /// believe we are close to it in the DHT, biasing it to keep us in a
    /// bucket near itself.
    pub fn spoof_neighbor(local: &NodeId, remote: &NodeId) -> NodeId {
        let mut buf = [0u8; ID_LEN];
        buf[..15].copy_from_slice(&remote.0[..15]);
        buf[15..].copy_from_slice(&local.0[..5]);
        NodeId(buf)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The XOR distance between two [`NodeId`]s. Ordered the same way the
/// 160-bit unsigned integer it represents would be, since both operands are
/// big-endian byte arrays and array comparison is lexicographic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
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

    fn id(last_byte: u8) -> NodeId {
        let mut buf = [0u8; ID_LEN];
        buf[ID_LEN - 1] = last_byte;
        NodeId(buf)
    }

    #[test]
    fn distance_is_symmetric() {
        let a = id(0x0f);
        let b = id(0xf0);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn distance_to_self_is_zero() {
        let a = NodeId::random();
        assert!(a.distance(&a).is_zero());
    }

    #[test]
    fn zero_distance_implies_equal_ids() {
        let a = id(7);
        let b = id(7);
        assert!(a.distance(&b).is_zero());
        assert_eq!(a, b);
    }

    #[test]
    fn distance_orders_by_unsigned_magnitude() {
        let target = id(0x00);
        let near = id(0x01);
        let far = id(0xff);
        assert!(target.distance(&near) < target.distance(&far));
    }

    #[test]
    fn spoof_neighbor_splices_prefix_and_suffix() {
        // Distinct bytes at every position, so a local[0:5]/local[15:20] mixup
        // can't hide behind a uniform byte value.
        let mut local_bytes = [0u8; ID_LEN];
        for (i, b) in local_bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let local = NodeId(local_bytes);
        let remote = NodeId([0xbb; ID_LEN]);
        let spoofed = NodeId::spoof_neighbor(&local, &remote);
        assert_eq!(&spoofed.as_bytes()[..15], &remote.as_bytes()[..15]);
        assert_eq!(&spoofed.as_bytes()[15..], &local.as_bytes()[..5]);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(NodeId::from_slice(&[0u8; 19]).is_none());
        assert!(NodeId::from_slice(&[0u8; 21]).is_none());
        assert!(NodeId::from_slice(&[0u8; 20]).is_some());
    }
}

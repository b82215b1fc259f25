//! The bucket-based routing table.
//!
//! Node ids occupy a 160-bit space; the table partitions that space into a
//! sequence of contiguous, non-overlapping, half-open ranges (buckets), each
//! holding up to [`K`] nodes. A bucket splits in two when it is full, a new
//! node falls inside its range, and either it contains our own id or it is
//! the last bucket in the table (the rule used to bound how many buckets a
//! crawler needs to keep refreshed, while still letting the region nearest
//! to us grow arbitrarily deep).
//!
//! The upper end of the id space is `2^160`, which doesn't fit in the
//! 20-byte [`NodeId`] representation, so bucket ranges are tracked with
//! [`Bound`], a 21-byte unsigned big-endian integer wide enough to name that
//! one extra value.
use std::time::{Duration, Instant};

use rand::Rng;

use super::id::{NodeId, ID_LEN};
use super::node::{Freshness, Node};

/// Max nodes held per bucket (the Kademlia "k" parameter).
pub const K: usize = 8;

/// Hard ceiling on how many buckets the table will split into. A fully
/// split table covers the 160-bit space one bit at a time, so this can
/// never legitimately be exceeded.
pub const MAX_BUCKETS: usize = ID_LEN * 8;

const BOUND_LEN: usize = ID_LEN + 1;

/// An unsigned big-endian integer one byte wider than [`NodeId`], so it can
/// represent `2^160` (the exclusive upper bound of the id space) without
/// wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bound([u8; BOUND_LEN]);

impl Bound {
    pub fn zero() -> Self {
        Bound([0u8; BOUND_LEN])
    }

    /// `2^160`, the exclusive upper bound of the node id space.
    pub fn id_space_end() -> Self {
        let mut bytes = [0u8; BOUND_LEN];
        bytes[0] = 1;
        Bound(bytes)
    }

    pub fn from_id(id: &NodeId) -> Self {
        let mut bytes = [0u8; BOUND_LEN];
        bytes[1..].copy_from_slice(id.as_bytes());
        Bound(bytes)
    }

    /// `(a + b) / 2`, computed exactly with byte-array arithmetic (both
    /// operands are at most `2^160`, so the sum never exceeds `2^161`,
    /// comfortably inside the headroom an extra carry byte provides).
    fn midpoint(a: &Bound, b: &Bound) -> Bound {
        let mut sum = [0u8; BOUND_LEN + 1];
        let mut carry = 0u16;
        for i in (0..BOUND_LEN).rev() {
            let s = a.0[i] as u16 + b.0[i] as u16 + carry;
            sum[i + 1] = (s & 0xff) as u8;
            carry = s >> 8;
        }
        sum[0] = carry as u8;

        let mut shifted = [0u8; BOUND_LEN + 1];
        let mut carry_bit = 0u8;
        for (i, byte) in sum.iter().enumerate() {
            shifted[i] = (byte >> 1) | (carry_bit << 7);
            carry_bit = byte & 1;
        }

        let mut result = [0u8; BOUND_LEN];
        result.copy_from_slice(&shifted[1..]);
        Bound(result)
    }
}

/// A contiguous, half-open `[start, end)` slice of the id space, holding up
/// to [`K`] nodes.
///
/// Because a split always halves at the exact midpoint, `[start, end)`
/// always coincides with a fixed-length bit prefix of the id space: `depth`
/// tracks how many high bits are fixed, which is what lets
/// [`Bucket::random_id`] sample a uniformly random id in range without
/// needing big-integer subtraction.
#[derive(Debug, Clone)]
pub struct Bucket {
    start: Bound,
    end: Bound,
    depth: u8,
    nodes: Vec<Node>,
    /// Last time a node in this bucket was added or touched; drives the
    /// per-bucket refresh `find_node` in the maintenance loop. `None` means
    /// "never", which is treated as overdue for refresh.
    last_active: Option<Instant>,
}

impl Bucket {
    fn contains(&self, id: &NodeId) -> bool {
        let b = Bound::from_id(id);
        self.start <= b && b < self.end
    }

    fn split(&self) -> (Bucket, Bucket) {
        let mid = Bound::midpoint(&self.start, &self.end);
        let mut low = Bucket {
            start: self.start,
            end: mid,
            depth: self.depth + 1,
            nodes: Vec::new(),
            last_active: None,
        };
        let mut high = Bucket {
            start: mid,
            end: self.end,
            depth: self.depth + 1,
            nodes: Vec::new(),
            last_active: None,
        };
        for node in &self.nodes {
            if low.contains(&node.id) {
                low.nodes.push(node.clone());
            } else {
                high.nodes.push(node.clone());
            }
        }
        (low, high)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn is_stale(&self, now: Instant, refresh_interval: Duration) -> bool {
        match self.last_active {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= refresh_interval,
        }
    }

    /// A uniformly random id within `[start, end)`: the top `depth` bits are
    /// copied from `start` (fixed for every id in this bucket), the rest are
    /// random.
    fn random_id(&self) -> NodeId {
        // `start` is always < 2^160 (only `end` of the last top-level bucket
        // can be exactly 2^160), so its leading byte is always zero and the
        // remaining 20 bytes are a valid NodeId prefix.
        let mut buf = [0u8; ID_LEN];
        buf.copy_from_slice(&self.start.0[1..]);

        let depth = self.depth as usize;
        let full_bytes = depth / 8;
        let rem_bits = depth % 8;
        if full_bytes >= ID_LEN {
            return NodeId::new(buf);
        }

        let mut rng = rand::rng();
        if rem_bits > 0 {
            let keep_mask = 0xffu8 << (8 - rem_bits);
            let mut random_byte = [0u8; 1];
            rng.fill(&mut random_byte);
            buf[full_bytes] = (buf[full_bytes] & keep_mask) | (random_byte[0] & !keep_mask);
        }
        let free_from = if rem_bits > 0 { full_bytes + 1 } else { full_bytes };
        if free_from < ID_LEN {
            rng.fill(&mut buf[free_from..]);
        }
        NodeId::new(buf)
    }
}

/// Outcome of [`RoutingTable::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new node was inserted.
    Inserted,
    /// An already-known node was touched (its `last_contact` refreshed).
    Updated,
    /// The owning bucket was full and not eligible to split; the node was
    /// not added.
    BucketFull,
}

/// The full 160-bit id space, partitioned into buckets.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    max_size: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, max_size: usize) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket {
                start: Bound::zero(),
                end: Bound::id_space_end(),
                depth: 0,
                nodes: Vec::new(),
                last_active: None,
            }],
            max_size,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    fn bucket_index_for(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.contains(id))
            .expect("buckets partition the entire id space")
    }

    /// Learns about (or refreshes) a node. See [`AddOutcome`] for the
    /// possible results.
    pub fn add(&mut self, id: NodeId, addr: std::net::SocketAddrV4, now: Instant) -> AddOutcome {
        if id == self.local_id {
            return AddOutcome::BucketFull;
        }
        let idx = self.bucket_index_for(&id);

        if let Some(existing) = self.buckets[idx].nodes.iter_mut().find(|n| n.id == id) {
            existing.touch(now);
            existing.addr = addr;
            self.buckets[idx].last_active = Some(now);
            return AddOutcome::Updated;
        }

        if self.buckets[idx].nodes.len() < K && self.len() < self.max_size {
            self.buckets[idx].nodes.push(Node::new(id, addr, now));
            self.buckets[idx].last_active = Some(now);
            return AddOutcome::Inserted;
        }

        let splittable = self.buckets.len() < MAX_BUCKETS
            && (self.buckets[idx].contains(&self.local_id) || idx == self.buckets.len() - 1);

        if !splittable {
            return AddOutcome::BucketFull;
        }

        let (low, high) = self.buckets[idx].split();
        self.buckets.splice(idx..=idx, [low, high]);
        self.add(id, addr, now)
    }

    /// The `count` nodes closest to `target` by XOR distance, across the
    /// whole table.
    pub fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut all: Vec<&Node> = self.buckets.iter().flat_map(|b| b.nodes.iter()).collect();
        all.sort_by_key(|n| target.distance(&n.id));
        all.into_iter().take(count).cloned().collect()
    }

    /// Nodes that haven't been heard from in 15-20 minutes: candidates for a
    /// refresh `ping`.
    pub fn unheard_nodes(&self, now: Instant) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| n.freshness(now) == Freshness::Unheard)
            .cloned()
            .collect()
    }

    /// Nodes that haven't been heard from in 20+ minutes: candidates for
    /// eviction.
    pub fn offline_nodes(&self, now: Instant) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| n.freshness(now) == Freshness::Offline)
            .cloned()
            .collect()
    }

    /// Drops every node whose freshness is [`Freshness::Offline`], returning
    /// how many were removed.
    pub fn remove_offline_nodes(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for bucket in &mut self.buckets {
            let before = bucket.nodes.len();
            bucket
                .nodes
                .retain(|n| n.freshness(now) != Freshness::Offline);
            removed += before - bucket.nodes.len();
        }
        removed
    }

    /// A random target id inside the range of each bucket that hasn't seen
    /// an added or refreshed node within `refresh_interval`, for the
    /// maintenance loop to issue a bucket-refresh `find_node` against.
    pub fn stale_bucket_targets(&self, now: Instant, refresh_interval: Duration) -> Vec<NodeId> {
        self.buckets
            .iter()
            .filter(|b| b.is_stale(now, refresh_interval))
            .map(|b| b.random_id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr() -> std::net::SocketAddrV4 {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn id_with_prefix_bit(bit: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        if bit == 1 {
            bytes[0] = 0x80;
        }
        NodeId::new(bytes)
    }

    #[test]
    fn buckets_partition_the_whole_space() {
        let table = RoutingTable::new(NodeId::random(), 10_000);
        assert_eq!(table.buckets().len(), 1);
        assert_eq!(table.buckets()[0].start, Bound::zero());
        assert_eq!(table.buckets()[0].end, Bound::id_space_end());
    }

    #[test]
    fn insert_then_update_same_node() {
        let mut table = RoutingTable::new(NodeId::random(), 10_000);
        let now = Instant::now();
        let id = NodeId::random();
        assert_eq!(table.add(id, addr(), now), AddOutcome::Inserted);
        assert_eq!(
            table.add(id, addr(), now + Duration::from_secs(1)),
            AddOutcome::Updated
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn bucket_capacity_is_respected() {
        let local = NodeId::new([0xff; ID_LEN]);
        let mut table = RoutingTable::new(local, 10_000);
        let now = Instant::now();
        // All of these share the high bit 0 (far from `local`, whose high
        // bit is 1), so they land in the same bucket and, being the *last*
        // bucket, that bucket is eligible to split when full.
        for i in 0..(K as u8 + 1) {
            let mut bytes = [0u8; ID_LEN];
            bytes[ID_LEN - 1] = i;
            table.add(NodeId::new(bytes), addr(), now);
        }
        assert_eq!(table.len(), K + 1);
        assert!(table.buckets().len() > 1);
    }

    #[test]
    fn full_non_splittable_bucket_rejects_new_node() {
        // Force a table with two buckets (split on the top bit) then fill
        // the bucket that does NOT contain the local id and is not last.
        let local = id_with_prefix_bit(1); // local id has top bit 1
        let mut table = RoutingTable::new(local, 10_000);
        let now = Instant::now();

        // Fill bucket 0 (top bit 0, far from local) past K to force a split
        // at the root, producing [low: bit0=0][high: bit0=1, contains local].
        for i in 0..(K as u8 + 1) {
            let mut bytes = [0u8; ID_LEN];
            bytes[ID_LEN - 1] = i;
            table.add(NodeId::new(bytes), addr(), now);
        }
        // Bucket "bit0=0" no longer contains local and is not the last
        // bucket (the "bit0=1" bucket is last), so once it's full again
        // further distinct entries with bit0=0 should be rejected.
        assert!(table.buckets().len() >= 2);

        let far_bucket_len = table
            .buckets()
            .iter()
            .find(|b| !b.contains(&local))
            .map(|b| b.nodes().len())
            .unwrap();
        assert!(far_bucket_len <= K);
    }

    #[test]
    fn closest_nodes_orders_by_xor_distance() {
        let mut table = RoutingTable::new(NodeId::random(), 10_000);
        let now = Instant::now();
        let target = NodeId::new([0u8; ID_LEN]);
        let near = {
            let mut b = [0u8; ID_LEN];
            b[ID_LEN - 1] = 1;
            NodeId::new(b)
        };
        let far = NodeId::new([0xff; ID_LEN]);
        table.add(far, addr(), now);
        table.add(near, addr(), now);
        let closest = table.closest_nodes(&target, 1);
        assert_eq!(closest[0].id, near);
    }

    #[test]
    fn remove_offline_nodes_drops_stale_entries() {
        let mut table = RoutingTable::new(NodeId::random(), 10_000);
        let now = Instant::now();
        table.add(NodeId::random(), addr(), now);
        let later = now + Duration::from_secs(21 * 60);
        let removed = table.remove_offline_nodes(later);
        assert_eq!(removed, 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn stale_bucket_targets_covers_every_bucket_before_any_traffic() {
        let table = RoutingTable::new(NodeId::random(), 10_000);
        let now = Instant::now();
        let targets = table.stale_bucket_targets(now, Duration::from_secs(300));
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn stale_bucket_targets_excludes_recently_active_buckets() {
        let mut table = RoutingTable::new(NodeId::random(), 10_000);
        let now = Instant::now();
        table.add(NodeId::random(), addr(), now);
        let targets = table.stale_bucket_targets(now, Duration::from_secs(300));
        assert!(targets.is_empty());
        let later = now + Duration::from_secs(301);
        assert_eq!(table.stale_bucket_targets(later, Duration::from_secs(300)).len(), 1);
    }

    #[test]
    fn bucket_random_id_falls_within_its_own_range() {
        let local = id_with_prefix_bit(1);
        let mut table = RoutingTable::new(local, 10_000);
        let now = Instant::now();
        for i in 0..(K as u8 + 1) {
            let mut bytes = [0u8; ID_LEN];
            bytes[ID_LEN - 1] = i;
            table.add(NodeId::new(bytes), addr(), now);
        }
        assert!(table.buckets().len() >= 2);
        for bucket in table.buckets() {
            let candidate = bucket.random_id();
            assert!(bucket.contains(&candidate));
        }
    }

    #[test]
    fn unheard_and_offline_classification() {
        let mut table = RoutingTable::new(NodeId::random(), 10_000);
        let now = Instant::now();
        table.add(NodeId::random(), addr(), now);
        let unheard_time = now + Duration::from_secs(16 * 60);
        assert_eq!(table.unheard_nodes(unheard_time).len(), 1);
        assert_eq!(table.offline_nodes(unheard_time).len(), 0);
    }
}

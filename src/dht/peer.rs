//! The announced-peer index: `infohash -> peers` learned via `announce_peer`.
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use super::id::NodeId;

/// Peers are forgotten 24 hours after their last announce, matching how long
/// a torrent's swarm membership is usually considered current.
pub const PEER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cap on how many peers are retained per infohash; announces beyond this
/// evict the oldest entry rather than grow unbounded under a popular swarm.
pub const MAX_PEERS_PER_INFOHASH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: SocketAddrV4,
}

impl Peer {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self { addr }
    }
}

struct Entry {
    peer: Peer,
    announced_at: Instant,
}

/// In-memory store of `announce_peer` results, keyed by infohash.
///
/// Not persisted across restarts; persistence is an external collaborator's
/// concern.
#[derive(Default)]
pub struct PeerIndex {
    by_infohash: HashMap<NodeId, Vec<Entry>>,
}

impl PeerIndex {
    pub fn new() -> Self {
        Self {
            by_infohash: HashMap::new(),
        }
    }

    /// Records `peer` as participating in the swarm for `infohash`. If the
    /// peer is already present its timestamp is refreshed in place; if the
    /// swarm is at capacity, the oldest entry is evicted first.
    pub fn announce(&mut self, infohash: NodeId, peer: Peer, now: Instant) {
        let entries = self.by_infohash.entry(infohash).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.peer == peer) {
            existing.announced_at = now;
            return;
        }
        if entries.len() >= MAX_PEERS_PER_INFOHASH {
            if let Some((oldest_idx, _)) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.announced_at)
            {
                entries.remove(oldest_idx);
            }
        }
        entries.push(Entry {
            peer,
            announced_at: now,
        });
    }

    /// Returns the peers currently known for `infohash`, excluding any whose
    /// TTL has lapsed relative to `now`.
    pub fn get_peers(&self, infohash: &NodeId, now: Instant) -> Vec<Peer> {
        self.by_infohash
            .get(infohash)
            .into_iter()
            .flatten()
            .filter(|e| now.saturating_duration_since(e.announced_at) < PEER_TTL)
            .map(|e| e.peer)
            .collect()
    }

    /// Drops every peer whose TTL has lapsed, and any infohash left with no
    /// peers. Meant to be called from the maintenance loop.
    pub fn sweep_expired(&mut self, now: Instant) {
        self.by_infohash.retain(|_, entries| {
            entries.retain(|e| now.saturating_duration_since(e.announced_at) < PEER_TTL);
            !entries.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddrV4 {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn announce_then_get_peers_round_trips() {
        let mut index = PeerIndex::new();
        let now = Instant::now();
        let infohash = NodeId::random();
        index.announce(infohash, Peer::new(addr(1000)), now);
        let peers = index.get_peers(&infohash, now);
        assert_eq!(peers, vec![Peer::new(addr(1000))]);
    }

    #[test]
    fn expired_peers_are_excluded() {
        let mut index = PeerIndex::new();
        let now = Instant::now();
        let infohash = NodeId::random();
        index.announce(infohash, Peer::new(addr(1000)), now);
        let later = now + PEER_TTL + Duration::from_secs(1);
        assert!(index.get_peers(&infohash, later).is_empty());
    }

    #[test]
    fn sweep_expired_removes_stale_entries_and_empty_infohashes() {
        let mut index = PeerIndex::new();
        let now = Instant::now();
        let infohash = NodeId::random();
        index.announce(infohash, Peer::new(addr(1000)), now);
        let later = now + PEER_TTL + Duration::from_secs(1);
        index.sweep_expired(later);
        assert!(index.by_infohash.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest_entry() {
        let mut index = PeerIndex::new();
        let now = Instant::now();
        let infohash = NodeId::random();
        for port in 0..MAX_PEERS_PER_INFOHASH as u16 {
            index.announce(
                infohash,
                Peer::new(addr(port)),
                now + Duration::from_secs(port as u64),
            );
        }
        let overflow_time = now + Duration::from_secs(MAX_PEERS_PER_INFOHASH as u64 + 10);
        index.announce(infohash, Peer::new(addr(9999)), overflow_time);
        let peers = index.get_peers(&infohash, overflow_time);
        assert_eq!(peers.len(), MAX_PEERS_PER_INFOHASH);
        assert!(!peers.contains(&Peer::new(addr(0))));
        assert!(peers.contains(&Peer::new(addr(9999))));
    }
}

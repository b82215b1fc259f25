//! Correlates outbound queries with their eventual responses.
//!
//! Unlike a scheme that reuses a single shared transaction id for every
//! outbound query, each query here gets a fresh random 2-byte `t`. A
//! response is matched to at most one outstanding transaction (the entry is
//! removed on first match), and stale entries are garbage-collected by TTL
//! so a query that never gets a reply doesn't leak memory forever.
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use rand::Rng;

use super::id::NodeId;

/// How long an outstanding transaction is kept waiting for a reply before
/// it's considered abandoned.
pub const TRANSACTION_TTL: Duration = Duration::from_secs(10);

/// What kind of query a transaction is waiting on a response for; lets the
/// dispatcher interpret a bare `r` dict without re-deriving the method from
/// its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingQuery {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

struct Entry {
    query: PendingQuery,
    target: SocketAddrV4,
    target_id: Option<NodeId>,
    sent_at: Instant,
}

/// Outstanding outbound queries, keyed by their 2-byte transaction id.
#[derive(Default)]
pub struct TransactionTable {
    pending: HashMap<[u8; 2], Entry>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Reserves a fresh transaction id for a query about to be sent to
    /// `target`, and records what kind of response to expect.
    pub fn begin(
        &mut self,
        query: PendingQuery,
        target: SocketAddrV4,
        target_id: Option<NodeId>,
        now: Instant,
    ) -> [u8; 2] {
        loop {
            let mut id = [0u8; 2];
            rand::rng().fill(&mut id);
            if !self.pending.contains_key(&id) {
                self.pending.insert(
                    id,
                    Entry {
                        query,
                        target,
                        target_id,
                        sent_at: now,
                    },
                );
                return id;
            }
        }
    }

    /// Consumes the transaction matching `id` if one is outstanding and came
    /// from `from`. A response is accepted at most once: whether this call
    /// succeeds or not, the entry is gone afterwards if it matched.
    pub fn take(&mut self, id: &[u8; 2], from: SocketAddrV4) -> Option<(PendingQuery, Option<NodeId>)> {
        let entry = self.pending.get(id)?;
        if entry.target != from {
            return None;
        }
        let entry = self.pending.remove(id)?;
        Some((entry.query, entry.target_id))
    }

    /// Drops every transaction older than [`TRANSACTION_TTL`], returning how
    /// many were reaped.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, e| now.saturating_duration_since(e.sent_at) < TRANSACTION_TTL);
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddrV4 {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn begin_then_take_round_trips() {
        let mut table = TransactionTable::new();
        let now = Instant::now();
        let id = table.begin(PendingQuery::Ping, addr(), None, now);
        let result = table.take(&id, addr());
        assert_eq!(result, Some((PendingQuery::Ping, None)));
    }

    #[test]
    fn take_is_one_shot() {
        let mut table = TransactionTable::new();
        let now = Instant::now();
        let id = table.begin(PendingQuery::Ping, addr(), None, now);
        assert!(table.take(&id, addr()).is_some());
        assert!(table.take(&id, addr()).is_none());
    }

    #[test]
    fn take_rejects_mismatched_sender() {
        let mut table = TransactionTable::new();
        let now = Instant::now();
        let id = table.begin(PendingQuery::Ping, addr(), None, now);
        let other: SocketAddrV4 = "10.0.0.1:6881".parse().unwrap();
        assert!(table.take(&id, other).is_none());
        // Still outstanding, so the legitimate sender can complete it later.
        assert!(table.take(&id, addr()).is_some());
    }

    #[test]
    fn expired_transactions_are_swept() {
        let mut table = TransactionTable::new();
        let now = Instant::now();
        let id = table.begin(PendingQuery::Ping, addr(), None, now);
        let later = now + TRANSACTION_TTL + Duration::from_secs(1);
        assert_eq!(table.sweep_expired(later), 1);
        assert!(table.take(&id, addr()).is_none());
    }
}

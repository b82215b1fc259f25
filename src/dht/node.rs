//! A remote node as tracked in our routing table.
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use super::id::NodeId;

/// A node is only worth routing table space if it could plausibly be a real
/// Internet peer: a private, loopback, link-local, multicast, or broadcast
/// address can't be a legitimate remote DHT participant and is almost
/// always a spoofed or misconfigured sender.
pub fn is_routable(ip: &Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast())
}

/// Whether `addr` could belong to a valid [`Node`]: a routable address and a
/// non-zero port (see [`is_routable`]).
pub fn is_valid_addr(addr: &SocketAddrV4) -> bool {
    is_routable(addr.ip()) && addr.port() > 0
}

/// A node is considered fresh until 15 minutes pass without contact, then
/// unheard until 20 minutes, then offline. These thresholds match the
/// "15 minutes of inactivity" rule BEP-5 recommends for bucket refresh.
pub const FRESH_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const UNHEARD_WINDOW: Duration = Duration::from_secs(20 * 60);

/// Where a node sits on the contact-recency spectrum, driving both refresh
/// and eviction decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Heard from within the last 15 minutes. Left alone.
    Fresh,
    /// Between 15 and 20 minutes since last contact. A candidate for a
    /// `ping` to confirm it is still alive.
    Unheard,
    /// 20 minutes or more since last contact. A candidate for eviction.
    Offline,
}

/// A single entry in a [`super::routing::Bucket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    last_contact: Instant,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddrV4, now: Instant) -> Self {
        Self {
            id,
            addr,
            last_contact: now,
        }
    }

    /// Records a successful query or response exchange with this node.
    pub fn touch(&mut self, now: Instant) {
        self.last_contact = now;
    }

    pub fn last_contact(&self) -> Instant {
        self.last_contact
    }

    pub fn is_valid(&self) -> bool {
        is_valid_addr(&self.addr)
    }

    pub fn freshness(&self, now: Instant) -> Freshness {
        let elapsed = now.saturating_duration_since(self.last_contact);
        if elapsed < FRESH_WINDOW {
            Freshness::Fresh
        } else if elapsed < UNHEARD_WINDOW {
            Freshness::Unheard
        } else {
            Freshness::Offline
        }
    }
}

//! `get_peers`/`announce_peer` tokens.
//!
//! A token is a short opaque value handed out in a `get_peers` response and
//! required back in a subsequent `announce_peer` from the same address,
//! proving the announce followed a `get_peers` rather than being a blind
//! spoofed write into the peer index. Rather than keep a per-address map of
//! issued tokens (unbounded under a flood of `get_peers`), tokens are
//! derived deterministically from the querier's address and a short-lived
//! secret — the same construction mainline clients use: `sha1(secret ‖
//! address)`, truncated. Validation just recomputes the hash against the
//! current and previous secret instead of looking anything up, so the table
//! never grows.
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use rand::Rng;
use sha1::{Digest, Sha1};

/// How long a token remains acceptable after being issued: one secret
/// rotation's worth of overlap with the previous secret.
pub const TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

const SECRET_LEN: usize = 20;
const TOKEN_LEN: usize = 8;
const ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

fn random_secret() -> [u8; SECRET_LEN] {
    let mut buf = [0u8; SECRET_LEN];
    rand::rng().fill(&mut buf);
    buf
}

fn derive(secret: &[u8; SECRET_LEN], addr: SocketAddrV4) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    hasher.update(addr.ip().octets());
    hasher.update(addr.port().to_be_bytes());
    hasher.finalize()[..TOKEN_LEN].to_vec()
}

/// Issues and validates `get_peers`/`announce_peer` tokens without storing
/// one entry per address: two secrets (current and previous) are enough to
/// both mint fresh tokens and accept ones minted up to [`TOKEN_TTL`] ago.
pub struct TokenTable {
    current_secret: [u8; SECRET_LEN],
    previous_secret: [u8; SECRET_LEN],
    rotated_at: Instant,
}

impl TokenTable {
    pub fn new() -> Self {
        let secret = random_secret();
        Self {
            current_secret: secret,
            previous_secret: secret,
            rotated_at: Instant::now(),
        }
    }

    /// Mints the token `addr` should receive right now.
    pub fn issue(&mut self, addr: SocketAddrV4, now: Instant) -> Vec<u8> {
        self.rotate_if_due(now);
        derive(&self.current_secret, addr)
    }

    /// Checks that `token` matches what would have been issued to `addr`
    /// under either the current or the previous secret.
    pub fn validate(&mut self, token: &[u8], addr: SocketAddrV4, now: Instant) -> bool {
        self.rotate_if_due(now);
        token == derive(&self.current_secret, addr).as_slice()
            || token == derive(&self.previous_secret, addr).as_slice()
    }

    /// Rotates the secret if more than [`ROTATE_INTERVAL`] has passed since
    /// the last rotation. Called from `issue`/`validate` and from the
    /// maintenance tick, so rotation progresses even during a quiet period
    /// with no queries to trigger it lazily.
    pub fn rotate_if_due(&mut self, now: Instant) {
        if now.saturating_duration_since(self.rotated_at) >= ROTATE_INTERVAL {
            self.previous_secret = self.current_secret;
            self.current_secret = random_secret();
            self.rotated_at = now;
        }
    }
}

impl Default for TokenTable {
    fn default() -> Self {
        Self::new()
    }
}

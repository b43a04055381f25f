//! Peer registry data model (§3) and the per-peer dial/session wrapper
//! (§4.2).

pub mod connection;

pub use connection::PeerConnection;

use crate::swarm::PublicKey;
use std::collections::HashSet;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerMode {
    Hyperswarm,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Registered,
    Connected,
    ConnectionFailed,
    Active,
}

/// One entry in the registry populated by `POST /register` (§3, §4.5).
#[derive(Debug, Clone)]
pub struct Peer {
    pub public_key: PublicKey,
    pub public_key_hex: String,
    pub mode: PeerMode,
    pub status: PeerStatus,
    pub last_seen: Instant,
    pub registered_at: Instant,
    pub relays: HashSet<String>,
}

impl Peer {
    pub fn new(public_key: PublicKey, mode: PeerMode, relays: HashSet<String>) -> Self {
        let now = Instant::now();
        Self {
            public_key,
            public_key_hex: hex::encode(public_key),
            mode,
            status: PeerStatus::Registered,
            last_seen: now,
            registered_at: now,
            relays,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

//! The DHT/swarm discovery layer is out of scope — it is modeled here as a
//! trait so the rest of the gateway can be built and tested without a real
//! distributed hash table. [`LoopbackSwarm`] is an in-process implementation
//! that pairs dialers by public key, standing in for hyperswarm during tests
//! and standalone runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

pub type PublicKey = [u8; 32];

/// Fixed discovery topic the pool joins once at startup (§4.3). Computed
/// once at call time rather than as a const since it hashes a literal.
pub fn discovery_topic() -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"hypertuna-relay-network");
    hasher.finalize().into()
}

/// The byte-duplex stream type handed back by a dial — boxed so concrete
/// swarm implementations aren't required to share a stream type.
pub type PeerStream = DuplexStream;

#[async_trait]
pub trait SwarmTransport: Send + Sync {
    /// Join a discovery topic as a client. Idempotent; implementations
    /// should treat a repeat join as a no-op after the first flush.
    async fn join_topic(&self, topic: [u8; 32]) -> anyhow::Result<()>;

    /// Register interest in directly dialing one peer (the "holepunch" join
    /// in §4.3); released via `leave_peer`.
    async fn join_peer(&self, public_key: PublicKey) -> anyhow::Result<()>;

    async fn leave_peer(&self, public_key: PublicKey);

    /// Obtain a stream to `public_key`, reusing an already-open inbound
    /// connection if one exists (§4.2 step 3a) or dialing fresh (3b).
    async fn connect(&self, public_key: PublicKey) -> anyhow::Result<PeerStream>;

    async fn destroy(&self);
}

/// An in-process stand-in for hyperswarm: dialing a public key that has a
/// registered peer-side acceptor hands both ends a connected
/// `tokio::io::duplex` pipe. Used for tests and for running the gateway
/// against an in-process mock peer without real network discovery.
pub struct LoopbackSwarm {
    acceptors: Mutex<HashMap<PublicKey, mpsc::UnboundedSender<PeerStream>>>,
}

impl Default for LoopbackSwarm {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackSwarm {
    pub fn new() -> Self {
        Self { acceptors: Mutex::new(HashMap::new()) }
    }

    /// Register a mock peer at `public_key`; returns the peer-side half of
    /// every future dial to that key as they arrive.
    pub async fn register_peer(self: &Arc<Self>, public_key: PublicKey) -> mpsc::UnboundedReceiver<PeerStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.acceptors.lock().await.insert(public_key, tx);
        rx
    }

    pub async fn unregister_peer(&self, public_key: PublicKey) {
        self.acceptors.lock().await.remove(&public_key);
    }
}

#[async_trait]
impl SwarmTransport for LoopbackSwarm {
    async fn join_topic(&self, _topic: [u8; 32]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn join_peer(&self, _public_key: PublicKey) -> anyhow::Result<()> {
        Ok(())
    }

    async fn leave_peer(&self, _public_key: PublicKey) {}

    async fn connect(&self, public_key: PublicKey) -> anyhow::Result<PeerStream> {
        let acceptors = self.acceptors.lock().await;
        let tx = acceptors
            .get(&public_key)
            .ok_or_else(|| anyhow::anyhow!("no registered peer for this public key"))?;
        let (client_end, peer_end) = tokio::io::duplex(64 * 1024);
        tx.send(peer_end)
            .map_err(|_| anyhow::anyhow!("peer acceptor dropped"))?;
        Ok(client_end)
    }

    async fn destroy(&self) {
        self.acceptors.lock().await.clear();
    }
}

pub fn public_key_from_hex(hex_str: &str) -> anyhow::Result<PublicKey> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("public key must be 32 bytes, got {}", v.len()))
}

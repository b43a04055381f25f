//! Connection pool (§4.3): owns the `publicKey → PeerConnection` map,
//! joins the fixed discovery topic once, and evicts stale connections.

use crate::config::GatewayConfig;
use crate::error::DialError;
use crate::peer::PeerConnection;
use crate::swarm::{discovery_topic, PublicKey, SwarmTransport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct ConnectionPool {
    swarm: Arc<dyn SwarmTransport>,
    connections: RwLock<HashMap<PublicKey, Arc<PeerConnection>>>,
    stale_after: std::time::Duration,
    dial_timeout: std::time::Duration,
    handshake_timeout: std::time::Duration,
    initialized: std::sync::atomic::AtomicBool,
}

impl ConnectionPool {
    pub fn new(swarm: Arc<dyn SwarmTransport>, config: &GatewayConfig) -> Self {
        Self {
            swarm,
            connections: RwLock::new(HashMap::new()),
            stale_after: config.stale_connection,
            dial_timeout: config.dial_timeout,
            handshake_timeout: config.handshake_timeout,
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Join the fixed discovery topic as a client, exactly once (§4.3).
    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.swarm.join_topic(discovery_topic()).await?;
        self.initialized.store(true, std::sync::atomic::Ordering::SeqCst);
        info!("connection pool initialized, discovery topic joined");
        Ok(())
    }

    pub async fn reinitialize(&self) -> anyhow::Result<()> {
        self.destroy().await;
        self.initialize().await
    }

    /// Return a live connection wrapper for `pk`, dialing if necessary and
    /// replacing it if the existing one is stale (§4.3 `getConnection`).
    pub async fn get_connection(&self, pk: PublicKey) -> Result<Arc<PeerConnection>, DialError> {
        let existing = {
            let table = self.connections.read().await;
            table.get(&pk).cloned()
        };

        let wrapper = match existing {
            Some(conn) if conn.last_used().elapsed() < self.stale_after => conn,
            Some(stale) => {
                stale.destroy().await;
                self.fresh_wrapper(pk).await
            }
            None => self.fresh_wrapper(pk).await,
        };

        wrapper.connect().await?;
        Ok(wrapper)
    }

    async fn fresh_wrapper(&self, pk: PublicKey) -> Arc<PeerConnection> {
        let wrapper = Arc::new(PeerConnection::new(pk, self.swarm.clone(), self.dial_timeout, self.handshake_timeout));
        self.connections.write().await.insert(pk, wrapper.clone());
        wrapper
    }

    pub async fn close_connection(&self, pk: PublicKey) {
        let removed = self.connections.write().await.remove(&pk);
        if let Some(conn) = removed {
            conn.destroy().await;
        }
        self.swarm.leave_peer(pk).await;
    }

    /// Best-effort lookup without dialing — used by the health manager and
    /// maintenance loops to inspect existing wrappers.
    pub async fn peek(&self, pk: PublicKey) -> Option<Arc<PeerConnection>> {
        self.connections.read().await.get(&pk).cloned()
    }

    pub async fn all_keys(&self) -> Vec<PublicKey> {
        self.connections.read().await.keys().copied().collect()
    }

    /// Close every connection whose `lastUsed` predates `stale_after` — part
    /// of the 60 s maintenance sweep (§4.5).
    pub async fn evict_stale(&self) -> usize {
        let stale: Vec<PublicKey> = {
            let table = self.connections.read().await;
            table
                .iter()
                .filter(|(_, conn)| conn.last_used().elapsed() >= self.stale_after)
                .map(|(pk, _)| *pk)
                .collect()
        };
        let count = stale.len();
        for pk in stale {
            self.close_connection(pk).await;
        }
        count
    }

    pub async fn destroy(&self) {
        let keys: Vec<PublicKey> = self.connections.read().await.keys().copied().collect();
        for pk in keys {
            self.close_connection(pk).await;
        }
        self.swarm.destroy().await;
        self.initialized.store(false, std::sync::atomic::Ordering::SeqCst);
        warn!("connection pool destroyed");
    }
}

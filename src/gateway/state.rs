//! The gateway's process-wide shared state (§9 "Global mutable state"):
//! `activePeers`, `activeRelays`, `wsConnections`, and `joinSessions`
//! packaged into one value instead of module-scoped singletons, in the
//! spirit of `clawd`'s `AppContext`.

use crate::config::GatewayConfig;
use crate::health::HealthManager;
use crate::peer::{Peer, PeerMode, PeerStatus};
use crate::pool::ConnectionPool;
use crate::swarm::{PublicKey, SwarmTransport};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Active,
    Degraded,
}

/// Per-relay aggregate (§3).
#[derive(Debug, Clone)]
pub struct RelayRecord {
    pub peers: HashSet<PublicKey>,
    pub profile_info: Option<serde_json::Value>,
    pub status: RelayStatus,
    pub created_at: Instant,
    pub last_active: Instant,
    pub last_successful_message: Option<Instant>,
}

impl RelayRecord {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            peers: HashSet::new(),
            profile_info: None,
            status: RelayStatus::Active,
            created_at: now,
            last_active: now,
            last_successful_message: None,
        }
    }
}

/// A `{pubkey}-{identifier}` join session (§4.5 "Join challenge"), TTL'd at
/// 5 minutes and swept lazily on each new join.
#[derive(Debug, Clone)]
pub struct JoinSession {
    pub peer_public_key: PublicKey,
    pub created_at: Instant,
    pub token: Option<String>,
}

pub const JOIN_SESSION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStep {
    VerifyOwnership,
    FinalizeAuth,
}

/// Everything the dispatch layer, the registration endpoint, and the
/// maintenance loops share. Subsystems take an `Arc<Gateway>` reference
/// rather than reaching into module-scoped globals.
pub struct Gateway {
    pub config: GatewayConfig,
    pub gateway_id: String,
    pub pool: ConnectionPool,
    pub health: HealthManager,
    peers: RwLock<HashMap<PublicKey, Peer>>,
    relays: RwLock<HashMap<String, RelayRecord>>,
    join_sessions: RwLock<HashMap<String, JoinSession>>,
    ws_sessions: RwLock<HashMap<String, String>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, gateway_id: String, swarm: Arc<dyn SwarmTransport>) -> Self {
        let breaker_config = crate::health::circuit_breaker::BreakerConfig {
            failure_threshold: config.failure_threshold,
            reset_timeout: config.breaker_timeout,
        };
        let pool = ConnectionPool::new(swarm, &config);
        let health = HealthManager::new(config.cleanup_threshold, config.health_timeout, breaker_config);
        Self {
            config,
            gateway_id,
            pool,
            health,
            peers: RwLock::new(HashMap::new()),
            relays: RwLock::new(HashMap::new()),
            join_sessions: RwLock::new(HashMap::new()),
            ws_sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_ws_session(&self, connection_key: String, relay_id: String) {
        self.ws_sessions.write().await.insert(connection_key, relay_id);
    }

    pub async fn unregister_ws_session(&self, connection_key: &str) {
        self.ws_sessions.write().await.remove(connection_key);
    }

    pub async fn ws_session_count(&self) -> usize {
        self.ws_sessions.read().await.len()
    }

    /// `POST /register` (§4.5): create or refresh a peer, insert it into
    /// every named relay's peer set, and for hyperswarm peers pre-populate
    /// a healthy marker to avoid the first-request "no healthy peers" race.
    pub async fn register_peer(&self, public_key: PublicKey, mode: PeerMode, relay_ids: &[String], profile_info: Option<serde_json::Value>) {
        {
            let mut peers = self.peers.write().await;
            let entry = peers.entry(public_key).or_insert_with(|| Peer::new(public_key, mode, HashSet::new()));
            entry.mode = mode;
            entry.status = PeerStatus::Registered;
            entry.touch();
            for id in relay_ids {
                entry.relays.insert(id.clone());
            }
        }
        {
            let mut relays = self.relays.write().await;
            for id in relay_ids {
                let record = relays.entry(id.clone()).or_insert_with(RelayRecord::new);
                record.peers.insert(public_key);
                record.last_active = Instant::now();
                if profile_info.is_some() {
                    record.profile_info = profile_info.clone();
                }
            }
        }
        if matches!(mode, PeerMode::Hyperswarm) {
            self.health.mark_preemptively_healthy(public_key).await;
        }
    }

    pub async fn peer(&self, pk: PublicKey) -> Option<Peer> {
        self.peers.read().await.get(&pk).cloned()
    }

    pub async fn touch_peer(&self, pk: PublicKey) {
        if let Some(peer) = self.peers.write().await.get_mut(&pk) {
            peer.touch();
        }
    }

    pub async fn all_peers(&self) -> Vec<Peer> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn relay_candidates(&self, relay_id: &str) -> Vec<PublicKey> {
        let relays = self.relays.read().await;
        let peers = self.peers.read().await;
        let Some(record) = relays.get(relay_id) else { return Vec::new() };
        record
            .peers
            .iter()
            .filter(|pk| peers.get(*pk).map(|p| p.mode == PeerMode::Hyperswarm).unwrap_or(false))
            .copied()
            .collect()
    }

    pub async fn mark_relay_success(&self, relay_id: &str) {
        if let Some(record) = self.relays.write().await.get_mut(relay_id) {
            record.last_successful_message = Some(Instant::now());
        }
    }

    pub async fn relay_snapshot(&self, relay_id: &str) -> Option<RelayRecord> {
        self.relays.read().await.get(relay_id).cloned()
    }

    pub async fn all_relay_ids(&self) -> Vec<String> {
        self.relays.read().await.keys().cloned().collect()
    }

    /// Remove `pk` from every relay's peer set and from the registry; drops
    /// relays left with an empty peer set (§3 RelayRecord lifecycle).
    pub async fn remove_peer(&self, pk: PublicKey) {
        self.peers.write().await.remove(&pk);
        let mut relays = self.relays.write().await;
        relays.retain(|_, record| {
            record.peers.remove(&pk);
            !record.peers.is_empty()
        });
        self.health.forget(pk).await;
    }

    pub async fn store_join_session(&self, key: String, session: JoinSession) {
        self.sweep_join_sessions().await;
        self.join_sessions.write().await.insert(key, session);
    }

    pub async fn take_join_session(&self, key: &str) -> Option<JoinSession> {
        self.sweep_join_sessions().await;
        self.join_sessions.read().await.get(key).cloned()
    }

    pub async fn set_join_session_token(&self, key: &str, token: String) {
        if let Some(session) = self.join_sessions.write().await.get_mut(key) {
            session.token = Some(token);
        }
    }

    pub async fn clear_join_session(&self, key: &str) {
        self.join_sessions.write().await.remove(key);
    }

    /// The scheme+host this gateway advertises in join-challenge callback
    /// URLs (§4.5). Plain HTTP unless a TLS bundle is configured — TLS
    /// material provisioning is out of scope, so this always advertises
    /// `http://`.
    pub fn public_base_url(&self) -> String {
        format!("http://{}:{}", self.config.hostname, self.config.port)
    }

    async fn sweep_join_sessions(&self) {
        let mut sessions = self.join_sessions.write().await;
        sessions.retain(|_, s| s.created_at.elapsed() < JOIN_SESSION_TTL);
    }
}

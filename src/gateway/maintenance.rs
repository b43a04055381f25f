//! Background maintenance loops (§4.5): peer cleanup every 60s, circuit
//! recovery sweep every 30s.

use super::state::Gateway;
use super::stats;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const RECOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// `cleanupInactivePeers`: health-check every known peer, drop the ones still
/// failing from their relays, and let the pool reclaim stale connections.
pub fn spawn_cleanup_loop(gateway: Arc<Gateway>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            cleanup_inactive_peers(&gateway).await;
        }
    })
}

/// Iterate hyperswarm peers, give a matured circuit breaker a chance to
/// half-open, and recheck health so a recovered peer rejoins the candidate
/// pool before the next client request needs it.
pub fn spawn_recovery_loop(gateway: Arc<Gateway>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RECOVERY_INTERVAL);
        loop {
            ticker.tick().await;
            recover_broken_circuits(&gateway).await;
        }
    })
}

async fn cleanup_inactive_peers(gateway: &Arc<Gateway>) {
    gateway.health.maybe_reset_metrics().await;
    let evicted = gateway.pool.evict_stale().await;
    if evicted > 0 {
        info!(evicted, "maintenance: evicted stale pool connections");
    }

    let unhealthy = gateway.health.unhealthy_peers().await;
    let mut removed = 0usize;
    for pk in unhealthy {
        if gateway.health.check_peer_health(&gateway.pool, pk).await {
            continue;
        }
        if gateway.health.is_circuit_broken(pk).await {
            gateway.remove_peer(pk).await;
            removed += 1;
        }
    }
    if removed > 0 {
        warn!(removed, "maintenance: dropped peers with an open circuit from their relays");
    }

    stats::write_snapshot(gateway).await;
}

async fn recover_broken_circuits(gateway: &Arc<Gateway>) {
    let peers = gateway.all_peers().await;
    for peer in peers {
        if gateway.health.is_circuit_broken(peer.public_key).await && gateway.health.attempt_circuit_reset(peer.public_key).await {
            gateway.health.check_peer_health(&gateway.pool, peer.public_key).await;
        }
    }
}

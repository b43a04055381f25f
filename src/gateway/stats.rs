//! `network_stats.json` snapshot writer (§6 "Persisted state").

use super::state::{Gateway, RelayStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

#[derive(Serialize)]
struct RelayStats {
    status: &'static str,
    #[serde(rename = "preferredRelays")]
    preferred_relays: Vec<String>,
    #[serde(rename = "totalPeers")]
    total_peers: usize,
    #[serde(rename = "healthyPeers")]
    healthy_peers: usize,
    #[serde(rename = "relayProfileInfo", skip_serializing_if = "Option::is_none")]
    relay_profile_info: Option<serde_json::Value>,
    #[serde(rename = "healthPercentage")]
    health_percentage: f64,
    #[serde(rename = "lastSuccessfulMessage", skip_serializing_if = "Option::is_none")]
    last_successful_message_ms_ago: Option<u128>,
}

#[derive(Serialize)]
struct NetworkStats {
    #[serde(rename = "activeRelays")]
    active_relays: usize,
    #[serde(rename = "peersOnline")]
    peers_online: usize,
    #[serde(rename = "healthMetrics")]
    health_metrics: crate::health::MetricsSnapshot,
    relays: HashMap<String, RelayStats>,
    #[serde(rename = "gatewayId")]
    gateway_id: String,
    #[serde(rename = "gatewayTimestamp")]
    gateway_timestamp: i64,
}

fn stats_path(gateway: &Gateway) -> PathBuf {
    gateway.config.writer_dir.join("network_stats.json")
}

/// Regenerate the snapshot file. Called after every peer-set change (§4.5);
/// failures are logged, never fatal — the external drive mirror this feeds
/// is out of scope.
pub async fn write_snapshot(gateway: &Gateway) {
    let relay_ids = gateway.all_relay_ids().await;
    let mut relays = HashMap::with_capacity(relay_ids.len());
    let mut peers_online = 0usize;

    for id in &relay_ids {
        let Some(record) = gateway.relay_snapshot(id).await else { continue };
        let total = record.peers.len();
        let mut healthy = 0usize;
        for pk in &record.peers {
            if gateway.health.is_peer_healthy(*pk).await {
                healthy += 1;
            }
        }
        peers_online += healthy;
        let health_percentage = if total == 0 { 0.0 } else { (healthy as f64 / total as f64) * 100.0 };
        relays.insert(
            id.clone(),
            RelayStats {
                status: match record.status {
                    RelayStatus::Active => "active",
                    RelayStatus::Degraded => "degraded",
                },
                preferred_relays: vec![id.clone()],
                total_peers: total,
                healthy_peers: healthy,
                relay_profile_info: record.profile_info.clone(),
                health_percentage,
                last_successful_message_ms_ago: record.last_successful_message.map(|t| t.elapsed().as_millis()),
            },
        );
    }

    let stats = NetworkStats {
        active_relays: relay_ids.len(),
        peers_online,
        health_metrics: gateway.health.metrics().snapshot(),
        relays,
        gateway_id: gateway.gateway_id.clone(),
        gateway_timestamp: chrono::Utc::now().timestamp_millis(),
    };

    let path = stats_path(gateway);
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(err = %e, "failed to create writer-dir for network_stats.json");
            return;
        }
    }
    match serde_json::to_vec_pretty(&stats) {
        Ok(bytes) => {
            if let Err(e) = tokio::fs::write(&path, bytes).await {
                warn!(err = %e, path = %path.display(), "failed to write network_stats.json");
            }
        }
        Err(e) => warn!(err = %e, "failed to serialize network_stats.json"),
    }
}

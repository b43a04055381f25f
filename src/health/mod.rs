//! Peer health manager (§4.4): decides whether a peer is usable right now
//! and keeps rolling metrics.

pub mod circuit_breaker;

use crate::pool::ConnectionPool;
use crate::swarm::PublicKey;
use circuit_breaker::{BreakerConfig, CircuitBreaker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Pending,
}

struct PeerHealthRecord {
    status: HealthStatus,
    last_check: Instant,
    response_time: Option<Duration>,
    error: Option<String>,
    breaker: CircuitBreaker,
}

impl PeerHealthRecord {
    fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            status: HealthStatus::Pending,
            last_check: Instant::now(),
            response_time: None,
            error: None,
            breaker: CircuitBreaker::new(breaker_config),
        }
    }
}

/// Counters reset every hour (§4.4), exposed read-only for `/debug/connections`
/// and `network_stats.json`.
#[derive(Default)]
pub struct Metrics {
    pub total_checks: AtomicU64,
    pub failed_checks: AtomicU64,
    pub recovered_peers: AtomicU64,
    pub healthy_peers: AtomicU64,
    pub unhealthy_peers: AtomicU64,
    pub circuits_broken: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            failed_checks: self.failed_checks.load(Ordering::Relaxed),
            recovered_peers: self.recovered_peers.load(Ordering::Relaxed),
            healthy_peers: self.healthy_peers.load(Ordering::Relaxed),
            unhealthy_peers: self.unhealthy_peers.load(Ordering::Relaxed),
            circuits_broken: self.circuits_broken.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total_checks.store(0, Ordering::Relaxed);
        self.failed_checks.store(0, Ordering::Relaxed);
        self.recovered_peers.store(0, Ordering::Relaxed);
        self.healthy_peers.store(0, Ordering::Relaxed);
        self.unhealthy_peers.store(0, Ordering::Relaxed);
        self.circuits_broken.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub total_checks: u64,
    pub failed_checks: u64,
    pub recovered_peers: u64,
    pub healthy_peers: u64,
    pub unhealthy_peers: u64,
    pub circuits_broken: u64,
}

pub struct HealthManager {
    records: Mutex<HashMap<PublicKey, PeerHealthRecord>>,
    check_locks: Mutex<HashMap<PublicKey, Arc<Mutex<()>>>>,
    metrics: Metrics,
    last_metrics_reset: Mutex<Instant>,
    cleanup_threshold: Duration,
    health_timeout: Duration,
    breaker_config: BreakerConfig,
}

impl HealthManager {
    pub fn new(cleanup_threshold: Duration, health_timeout: Duration, breaker_config: BreakerConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            check_locks: Mutex::new(HashMap::new()),
            metrics: Metrics::default(),
            last_metrics_reset: Mutex::new(Instant::now()),
            cleanup_threshold,
            health_timeout,
            breaker_config,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    async fn lock_for(&self, pk: PublicKey) -> Arc<Mutex<()>> {
        let mut locks = self.check_locks.lock().await;
        locks.entry(pk).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Run a health check against `pk` through `pool`, coalescing concurrent
    /// callers: whoever can't acquire the per-peer lock immediately gets
    /// the current `is_peer_healthy` verdict instead of queueing.
    pub async fn check_peer_health(&self, pool: &ConnectionPool, pk: PublicKey) -> bool {
        let lock = self.lock_for(pk).await;
        let guard = match lock.try_lock() {
            Ok(g) => g,
            Err(_) => return self.is_peer_healthy(pk).await,
        };

        self.metrics.total_checks.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = match pool.get_connection(pk).await {
            Ok(conn) => conn.health_check(self.health_timeout).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let elapsed = started.elapsed();

        let mut records = self.records.lock().await;
        let record = records.entry(pk).or_insert_with(|| PeerHealthRecord::new(self.breaker_config));

        let healthy = match result {
            Ok(resp) => {
                let recovered = record.breaker.record_success();
                record.status = HealthStatus::Healthy;
                record.last_check = Instant::now();
                record.response_time = Some(elapsed);
                record.error = None;
                self.metrics.healthy_peers.fetch_add(1, Ordering::Relaxed);
                if recovered {
                    self.metrics.recovered_peers.fetch_add(1, Ordering::Relaxed);
                }
                debug!(pk = %hex::encode(pk), status = %resp.status, "health check ok");
                true
            }
            Err(err) => {
                record.status = HealthStatus::Unhealthy;
                record.last_check = Instant::now();
                record.error = Some(err);
                self.metrics.failed_checks.fetch_add(1, Ordering::Relaxed);
                self.metrics.unhealthy_peers.fetch_add(1, Ordering::Relaxed);
                if record.breaker.record_failure() {
                    self.metrics.circuits_broken.fetch_add(1, Ordering::Relaxed);
                }
                false
            }
        };
        drop(guard);
        healthy
    }

    /// True iff the last record is healthy, fresh, and the breaker isn't open.
    pub async fn is_peer_healthy(&self, pk: PublicKey) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&pk) else { return false };
        record.status == HealthStatus::Healthy
            && record.last_check.elapsed() < self.cleanup_threshold
            && !record.breaker.is_open()
    }

    /// Pre-populate a healthy marker at registration time (§4.5) so a
    /// request arriving before the first real check doesn't see "no
    /// healthy peers".
    pub async fn mark_preemptively_healthy(&self, pk: PublicKey) {
        let mut records = self.records.lock().await;
        let record = records.entry(pk).or_insert_with(|| PeerHealthRecord::new(self.breaker_config));
        record.status = HealthStatus::Healthy;
        record.last_check = Instant::now();
    }

    pub async fn is_circuit_broken(&self, pk: PublicKey) -> bool {
        let mut records = self.records.lock().await;
        records.get_mut(&pk).map(|r| r.breaker.is_open()).unwrap_or(false)
    }

    pub async fn attempt_circuit_reset(&self, pk: PublicKey) -> bool {
        let mut records = self.records.lock().await;
        records.get_mut(&pk).map(|r| r.breaker.attempt_reset()).unwrap_or(false)
    }

    /// §4.4 `findHealthyPeerForRelay`.
    pub async fn find_healthy_peer_for_relay(
        &self,
        pool: &ConnectionPool,
        candidates: &[PublicKey],
        force_recheck: bool,
    ) -> Option<PublicKey> {
        if !force_recheck {
            for &pk in candidates {
                if self.is_peer_healthy(pk).await {
                    return Some(pk);
                }
            }
        }

        for &pk in candidates {
            if self.attempt_circuit_reset(pk).await && self.check_peer_health(pool, pk).await {
                return Some(pk);
            }
        }

        for &pk in candidates {
            if self.check_peer_health(pool, pk).await {
                return Some(pk);
            }
        }

        None
    }

    pub async fn maybe_reset_metrics(&self) {
        let mut last_reset = self.last_metrics_reset.lock().await;
        if last_reset.elapsed() >= Duration::from_secs(3600) {
            self.metrics.reset();
            *last_reset = Instant::now();
        }
    }

    pub async fn unhealthy_peers(&self) -> Vec<PublicKey> {
        let records = self.records.lock().await;
        records
            .iter()
            .filter(|(_, r)| r.status != HealthStatus::Healthy)
            .map(|(pk, _)| *pk)
            .collect()
    }

    pub async fn forget(&self, pk: PublicKey) {
        self.records.lock().await.remove(&pk);
        self.check_locks.lock().await.remove(&pk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, GatewayConfig};
    use crate::swarm::LoopbackSwarm;

    fn test_config() -> GatewayConfig {
        let dir = std::env::temp_dir().join(format!("gateway-health-test-{:?}", std::thread::current().id()));
        GatewayConfig::load(ConfigOverrides { data_dir: Some(dir), ..Default::default() }).unwrap()
    }

    fn fast_breaker() -> BreakerConfig {
        BreakerConfig { failure_threshold: 3, reset_timeout: Duration::from_millis(80) }
    }

    #[tokio::test]
    async fn unregistered_peer_reports_unhealthy() {
        let swarm = Arc::new(LoopbackSwarm::new());
        let pool = ConnectionPool::new(swarm, &test_config());
        pool.initialize().await.unwrap();
        let manager = HealthManager::new(Duration::from_secs(300), Duration::from_millis(200), fast_breaker());

        let ok = manager.check_peer_health(&pool, [1u8; 32]).await;
        assert!(!ok);
        assert!(!manager.is_peer_healthy([1u8; 32]).await);
    }

    #[tokio::test]
    async fn three_failures_open_the_breaker_for_the_timeout_window() {
        let swarm = Arc::new(LoopbackSwarm::new());
        let pool = ConnectionPool::new(swarm, &test_config());
        pool.initialize().await.unwrap();
        let manager = HealthManager::new(Duration::from_secs(300), Duration::from_millis(50), fast_breaker());
        let pk = [2u8; 32];

        for _ in 0..3 {
            manager.check_peer_health(&pool, pk).await;
        }
        assert!(manager.is_circuit_broken(pk).await);
        assert!(!manager.is_peer_healthy(pk).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.is_circuit_broken(pk).await);
    }
}

//! Gateway configuration — CLI / env / TOML-file layering.
//!
//! Priority (highest to lowest): CLI flag / env var > TOML file > built-in
//! default. Mirrors `clawd::config::DaemonConfig`.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 8443;
const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
const DEFAULT_HOSTNAME: &str = "localhost";
const DEFAULT_WRITER_DIR: &str = "./writer-dir";

const DEFAULT_STALE_CONNECTION_SECS: u64 = 600;
const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 15;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_BREAKER_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CLEANUP_THRESHOLD_SECS: u64 = 300;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/gateway.toml` (or the file passed positionally on the CLI) —
/// all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    listen_host: Option<String>,
    hostname: Option<String>,
    detect_public_ip: Option<bool>,
    log: Option<String>,
    writer_dir: Option<String>,
    stale_connection_secs: Option<u64>,
    dial_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    rpc_timeout_secs: Option<u64>,
    health_timeout_secs: Option<u64>,
    failure_threshold: Option<u32>,
    breaker_timeout_secs: Option<u64>,
    cleanup_threshold_secs: Option<u64>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse gateway config — using defaults");
            None
        }
    }
}

// ─── GatewayConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub listen_host: IpAddr,
    pub hostname: String,
    pub detect_public_ip: bool,
    pub data_dir: PathBuf,
    pub log: String,
    pub writer_dir: PathBuf,

    pub stale_connection: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub rpc_timeout: Duration,
    pub health_timeout: Duration,

    pub failure_threshold: u32,
    pub breaker_timeout: Duration,
    pub cleanup_threshold: Duration,
}

/// Raw CLI/env overrides, as parsed by clap in `main.rs`. Kept separate from
/// `GatewayConfig` so the TOML-layering logic below has a single, testable
/// entry point independent of the `clap::Parser` derive.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub listen_host: Option<String>,
    pub hostname: Option<String>,
    pub detect_public_ip: Option<bool>,
    pub data_dir: Option<PathBuf>,
    pub log: Option<String>,
}

impl GatewayConfig {
    pub fn load(overrides: ConfigOverrides) -> anyhow::Result<Self> {
        let data_dir = overrides.data_dir.clone().unwrap_or_else(default_data_dir);
        let toml_path = overrides
            .config_path
            .clone()
            .unwrap_or_else(|| data_dir.join("gateway.toml"));
        let toml = load_toml(&toml_path).unwrap_or_default();

        let port = overrides.port.or(toml.port).unwrap_or(DEFAULT_PORT);

        let listen_host_str = overrides
            .listen_host
            .or(toml.listen_host)
            .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string());
        let listen_host: IpAddr = listen_host_str
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen host '{listen_host_str}': {e}"))?;

        let hostname = overrides
            .hostname
            .or(toml.hostname)
            .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());

        let detect_public_ip = overrides
            .detect_public_ip
            .or(toml.detect_public_ip)
            .unwrap_or(false);

        let log = overrides.log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let writer_dir = toml
            .writer_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WRITER_DIR));

        Ok(Self {
            port,
            listen_host,
            hostname,
            detect_public_ip,
            data_dir,
            log,
            writer_dir,
            stale_connection: Duration::from_secs(
                toml.stale_connection_secs.unwrap_or(DEFAULT_STALE_CONNECTION_SECS),
            ),
            dial_timeout: Duration::from_secs(
                toml.dial_timeout_secs.unwrap_or(DEFAULT_DIAL_TIMEOUT_SECS),
            ),
            handshake_timeout: Duration::from_secs(
                toml.handshake_timeout_secs.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            ),
            rpc_timeout: Duration::from_secs(toml.rpc_timeout_secs.unwrap_or(DEFAULT_RPC_TIMEOUT_SECS)),
            health_timeout: Duration::from_secs(
                toml.health_timeout_secs.unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECS),
            ),
            failure_threshold: toml.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            breaker_timeout: Duration::from_secs(
                toml.breaker_timeout_secs.unwrap_or(DEFAULT_BREAKER_TIMEOUT_SECS),
            ),
            cleanup_threshold: Duration::from_secs(
                toml.cleanup_threshold_secs.unwrap_or(DEFAULT_CLEANUP_THRESHOLD_SECS),
            ),
        })
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("hypertuna-gateway");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/hypertuna-gateway");
    }
    PathBuf::from(".hypertuna-gateway")
}

// ─── Hot-reloadable subset (log level only) ──────────────────────────────────

/// Watches the TOML config file for changes and reloads the log level only.
/// Port, listen host, and timeout tunables are startup-only and require a
/// restart — identical tradeoff to the daemon's `ConfigWatcher`.
pub struct LogLevelWatcher {
    pub level: std::sync::Arc<tokio::sync::RwLock<String>>,
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl LogLevelWatcher {
    pub fn start(config_path: &Path, initial_level: &str) -> Option<Self> {
        let level = std::sync::Arc::new(tokio::sync::RwLock::new(initial_level.to_string()));
        let level_clone = level.clone();
        let path_clone = config_path.to_path_buf();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    use notify_debouncer_full::notify::EventKind;
                    let relevant = events
                        .iter()
                        .any(|e| matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_)));
                    if relevant {
                        let level = level_clone.clone();
                        let path = path_clone.clone();
                        rt_handle.spawn(async move {
                            if let Some(new_log) = load_toml(&path).and_then(|t| t.log) {
                                let mut guard = level.write().await;
                                if *guard != new_log {
                                    info!(log_level = %new_log, "gateway config reloaded");
                                    *guard = new_log;
                                }
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer
                    .watcher()
                    .watch(watch_path, notify_debouncer_full::notify::RecursiveMode::NonRecursive)
                {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                Some(Self { level, _watcher: debouncer })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_overrides_or_file() {
        let dir = std::env::temp_dir().join("gateway-config-test-defaults");
        let cfg = GatewayConfig::load(ConfigOverrides {
            data_dir: Some(dir),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.hostname, DEFAULT_HOSTNAME);
        assert!(!cfg.detect_public_ip);
        assert_eq!(cfg.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
    }

    #[test]
    fn cli_override_wins_over_toml_and_default() {
        let dir = std::env::temp_dir().join("gateway-config-test-override");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("gateway.toml"), "port = 9000\n").unwrap();
        let cfg = GatewayConfig::load(ConfigOverrides {
            data_dir: Some(dir.clone()),
            port: Some(7000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.port, 7000);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn toml_wins_over_default() {
        let dir = std::env::temp_dir().join("gateway-config-test-toml");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("gateway.toml"), "port = 9001\n").unwrap();
        let cfg = GatewayConfig::load(ConfigOverrides {
            data_dir: Some(dir.clone()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.port, 9001);
        std::fs::remove_dir_all(&dir).ok();
    }
}

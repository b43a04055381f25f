use anyhow::{Context as _, Result};
use clap::Parser;
use gateway::config::{ConfigOverrides, GatewayConfig, LogLevelWatcher};
use gateway::gateway::{http, maintenance};
use gateway::identity;
use gateway::swarm::LoopbackSwarm;
use gateway::Gateway;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "hypertuna-gateway", about = "Relay gateway — bridges HTTP/WS clients to a swarm of backend relay peers", version)]
struct Args {
    /// Path to a gateway.toml config file (default: {data_dir}/gateway.toml)
    config: Option<PathBuf>,

    /// Listener port
    #[arg(long, env = "GATEWAY_PORT")]
    port: Option<u16>,

    /// Address to bind the listener on
    #[arg(long, env = "GATEWAY_LISTEN_HOST")]
    listen_host: Option<String>,

    /// Hostname advertised in join-challenge callback URLs
    #[arg(long, env = "GATEWAY_HOSTNAME")]
    hostname: Option<String>,

    /// Attempt to detect and advertise this host's public IP
    #[arg(long, env = "GATEWAY_DETECT_PUBLIC_IP")]
    detect_public_ip: Option<bool>,

    /// Data directory for the gateway id and config file
    #[arg(long, env = "GATEWAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GATEWAY_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();

    if let Err(e) = run(args).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "hypertuna-gateway starting");

    let config = GatewayConfig::load(ConfigOverrides {
        config_path: args.config,
        port: args.port,
        listen_host: args.listen_host,
        hostname: args.hostname,
        detect_public_ip: args.detect_public_ip,
        data_dir: args.data_dir,
        log: args.log,
    })
    .context("failed to load gateway configuration")?;

    info!(port = config.port, hostname = %config.hostname, data_dir = %config.data_dir.display(), "config loaded");

    let _log_watcher = LogLevelWatcher::start(&config.data_dir.join("gateway.toml"), &config.log);

    let gateway_id = identity::get_or_create_gateway_id(&config.data_dir).context("failed to establish gateway identity")?;
    info!(gateway_id = %gateway_id, "gateway identity ready");

    // The DHT/swarm discovery layer is out of scope (§1 Non-goals); the only
    // `SwarmTransport` shipped here is the in-process loopback used for tests
    // and standalone runs — wiring a real hyperswarm client is future work.
    let swarm = Arc::new(LoopbackSwarm::new());

    let gateway = Arc::new(Gateway::new(config.clone(), gateway_id, swarm));
    gateway.pool.initialize().await.context("failed to initialize connection pool")?;

    let cleanup_handle = maintenance::spawn_cleanup_loop(gateway.clone());
    let recovery_handle = maintenance::spawn_recovery_loop(gateway.clone());

    let router = http::router(gateway.clone());
    let addr = std::net::SocketAddr::new(config.listen_host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "gateway listening (HTTP + WebSocket on the same port)");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown signal received — draining connections");
    cleanup_handle.abort();
    recovery_handle.abort();
    gateway.pool.destroy().await;
    warn!("gateway stopped");
    Ok(())
}

/// Resolves on SIGTERM (Unix) or Ctrl-C (all platforms).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

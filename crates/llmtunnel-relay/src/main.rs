//! llmtunnel Relay Server
//!
//! Tunnel control plane: admits, meters and routes requests to local LLM
//! endpoints through desktop agent sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use llmtunnel_core::SystemClock;
use llmtunnel_relay::api::{AppState, build_router};
use llmtunnel_relay::auth::JwtManager;
use llmtunnel_relay::config::RelayConfig;
use llmtunnel_relay::storage::RelayDatabase;

#[derive(Parser, Debug)]
#[command(name = "llmtunnel-relay")]
#[command(
    version,
    about = "llmtunnel relay - tunnel control plane for local LLM endpoints"
)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "LLMTUNNEL_ADDR", default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// Path to SQLite database file.
    #[arg(long, env = "LLMTUNNEL_DB_PATH")]
    db_path: Option<PathBuf>,

    /// JWT secret shared with the identity service.
    #[arg(
        long,
        env = "LLMTUNNEL_JWT_SECRET",
        default_value = "dev-secret-change-me"
    )]
    jwt_secret: String,

    /// Lifetime of tokens issued by local tooling, in seconds.
    #[arg(long, env = "LLMTUNNEL_ACCESS_TTL", default_value_t = 3600)]
    access_ttl: i64,

    /// JSON config file merged over the built-in defaults.
    #[arg(long, env = "LLMTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Endpoint health check interval in seconds.
    #[arg(long, env = "LLMTUNNEL_HEALTH_INTERVAL")]
    health_interval: Option<u64>,

    /// Per-probe timeout in seconds.
    #[arg(long, env = "LLMTUNNEL_PROBE_TIMEOUT")]
    probe_timeout: Option<u64>,

    /// Metrics flush interval in seconds.
    #[arg(long, env = "LLMTUNNEL_METRICS_FLUSH_INTERVAL")]
    metrics_flush_interval: Option<u64>,

    /// Webhook retry sweep interval in seconds.
    #[arg(long, env = "LLMTUNNEL_WEBHOOK_SWEEP_INTERVAL")]
    webhook_sweep_interval: Option<u64>,

    /// Per-attempt webhook HTTP timeout in seconds.
    #[arg(long, env = "LLMTUNNEL_WEBHOOK_TIMEOUT")]
    webhook_timeout: Option<u64>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "LLMTUNNEL_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Command-line values win over the config file.
    fn apply_overrides(&self, config: &mut RelayConfig) {
        if let Some(secs) = self.health_interval {
            config.health.interval_secs = secs;
        }
        if let Some(secs) = self.probe_timeout {
            config.health.probe_timeout_secs = secs;
        }
        if let Some(secs) = self.metrics_flush_interval {
            config.health.metrics_flush_interval_secs = secs;
        }
        if let Some(secs) = self.webhook_sweep_interval {
            config.webhook.sweep_interval_secs = secs;
        }
        if let Some(secs) = self.webhook_timeout {
            config.webhook.timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    llmtunnel_core::tracing_init::init_tracing("llmtunnel_relay=info", args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting llmtunnel-relay"
    );

    let metrics = match llmtunnel_core::metrics::install_prometheus_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable, /metrics disabled");
            None
        }
    };

    let mut config: RelayConfig = llmtunnel_core::config::load_config(args.config.as_deref())?;
    args.apply_overrides(&mut config);

    let db_path = match &args.db_path {
        Some(path) => path.clone(),
        None => llmtunnel_core::config::database_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine default database path"))?,
    };
    info!(path = %db_path.display(), "Opening relay database");
    let db = RelayDatabase::open(&db_path).await?;

    // No agent survives a restart.
    let reset = db.disconnect_all_tunnels(llmtunnel_core::db::unix_millis()).await?;
    if reset > 0 {
        info!(tunnels = reset, "Marked tunnels from previous run as disconnected");
    }

    let jwt = JwtManager::new(args.jwt_secret.as_bytes(), args.access_ttl);
    let (state, events) = AppState::new(&db, &config, jwt, Arc::new(SystemClock), metrics);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = state.spawn_background(events, &shutdown_rx);

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!(addr = %args.addr, "Relay server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    state.tunnels.health().stop_all();
    for task in background {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Relay stopped");
    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::clock::{Clock, SystemClock};
use tollgate::config::{StoreBackend, TollgateConfig};
use tollgate::http::{AppState, HttpServer};
use tollgate::ratelimit::{Algorithms, ApiGuard, RateLimitEngine, RuleSet};
use tollgate::store::{MemoryStore, RestStore, Store};
use tollgate::tenancy::{LogAlertDispatcher, StaticCredentials, TierQuota, UsageLedger};

/// Multi-tenant rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Override the log filter, e.g. `debug` or `tollgate=trace`
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config);

    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-process store; limits are not shared between instances");
            Arc::new(MemoryStore::new(clock.clone()))
        }
        StoreBackend::Rest => {
            let url = config.store.url.as_deref().unwrap_or_default();
            let token = config.store.token.as_deref().unwrap_or_default();
            info!(url, timeout_ms = config.store.timeout_ms, "Using REST store");
            Arc::new(RestStore::new(url, token, config.store.timeout())?)
        }
    };

    let rules = match &config.rules_path {
        Some(path) => RuleSet::from_file(path)?,
        None => {
            warn!("No rules_path configured; every check will be allowed");
            RuleSet::new()
        }
    };
    info!(rules = rules.len(), "Rate limit rules loaded");

    let ledger = Arc::new(UsageLedger::new());
    let quota = TierQuota::new(config.tenants.clone(), ledger.clone(), clock.clone());
    let credentials = StaticCredentials::new(config.credentials.clone());
    info!(credentials = credentials.len(), "API keys loaded");

    let engine = RateLimitEngine::new(
        Arc::new(rules),
        Algorithms::new(store.clone(), clock.clone()),
        Arc::new(quota),
        ledger,
        Arc::new(LogAlertDispatcher),
        clock.clone(),
        &config.engine,
    );
    let guard = ApiGuard::new(store, clock, &config.api_guard);

    let state = AppState {
        engine: Arc::new(engine),
        guard: Arc::new(guard),
        credentials: Arc::new(credentials),
    };

    HttpServer::new(config.server.http_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(config: &TollgateConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

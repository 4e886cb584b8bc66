use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::http::{HttpServer, RateLimitState};
use turnstile::ratelimit::{ApiKeyRules, LimitPolicy, RateLimiter};
use turnstile::store::{MemoryStore, StateStore};

/// Sliding-window rate limiter in front of an HTTP service.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing; RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
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

    info!("Starting Turnstile Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(args.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        store = ?config.store.backend,
        consistency = ?config.rate_limiting.consistency,
        "Configuration loaded"
    );

    let policy = initial_policy(&config)?;

    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_sweeper(store.clone(), config.store.sweep_interval_secs);
            run(config, store, policy).await
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = turnstile::store::RedisStore::connect(
                &config.store.redis_url,
                config.store.key_prefix.clone(),
            )
            .await?;
            store.health_check().await?;
            run(config, Arc::new(store), policy).await
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            anyhow::bail!("store.backend is redis but turnstile was built without the redis feature")
        }
    }
}

/// Class rules plus the per-key rules file, if one is configured.
fn initial_policy(config: &TurnstileConfig) -> anyhow::Result<LimitPolicy> {
    let policy = config.policy();
    match &config.rate_limiting.rules_path {
        Some(path) => {
            let rules = ApiKeyRules::from_file(path)?;
            info!(keys = rules.api_keys.len(), "API key rules loaded");
            let policy = policy.with_api_keys(rules);
            policy.validate()?;
            Ok(policy)
        }
        None => Ok(policy),
    }
}

async fn run<S: StateStore + 'static>(
    config: TurnstileConfig,
    store: Arc<S>,
    policy: LimitPolicy,
) -> anyhow::Result<()> {
    let rate_limiter = Arc::new(
        RateLimiter::new(store, policy).with_settings(config.engine_settings()),
    );
    info!("Rate limiter initialized");

    if let (Some(path), Some(interval)) = (
        config.rate_limiting.rules_path.clone(),
        config.reload_interval(),
    ) {
        spawn_rules_reload(rate_limiter.clone(), config.policy(), path, interval);
    }

    let state = RateLimitState::new(rate_limiter, config.api_key_header()?)
        .trust_forwarded_for(config.server.trust_forwarded_for);
    let http_server = HttpServer::new(config.server.http_addr, state);

    info!("Starting HTTP server on {}", config.server.http_addr);

    // Run the server with graceful shutdown on Ctrl+C
    http_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile Rate Limiting Service stopped");
    Ok(())
}

/// Periodically drop expired windows and blocks from the memory store.
fn spawn_sweeper(store: Arc<MemoryStore>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            store.purge_expired(chrono::Utc::now());
        }
    });
}

/// Re-read the API key rules file on an interval. A file that fails to load
/// leaves the current rules in place.
fn spawn_rules_reload<S: StateStore + 'static>(
    rate_limiter: Arc<RateLimiter<S>>,
    base: LimitPolicy,
    path: String,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reloaded = ApiKeyRules::from_file(&path)
                .map(|rules| base.clone().with_api_keys(rules))
                .and_then(|policy| {
                    policy.validate()?;
                    Ok(policy)
                });
            match reloaded {
                Ok(policy) => {
                    if policy != rate_limiter.policy() {
                        info!(path = %path, keys = policy.api_keys.len(), "API key rules reloaded");
                        rate_limiter.set_policy(policy);
                    }
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to reload API key rules, keeping current rules");
                }
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

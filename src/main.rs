//! EnMS Analytics Service — service binary
//!
//! Startup order: store pool → health check → event bus → subscriber →
//! stuck-job cleanup → scheduler → HTTP/WS listener. Shutdown runs in
//! reverse under a 30-second deadline, after which the watchdog forces the
//! process down.
//!
//! # Environment Variables
//!
//! | Variable | Required | Description |
//! |----------|----------|-------------|
//! | `DATABASE_URL` (or `DB_*`) | Yes | PostgreSQL/TimescaleDB location |
//! | `BUS_HOST` / `BUS_PORT` / `BUS_PASSWORD` / `BUS_DB` | No | Redis event bus |
//! | `BUS_PUBSUB_ENABLED` | No | Disable event delivery (default true) |
//! | `WEBSOCKET_*`, `RATE_LIMITS`, `WHITELIST` | No | Fan-out and limiter tuning |
//! | `TARIFF_PEAK` / `TARIFF_OFF_PEAK` / `CARBON_FACTOR` | No | KPI pricing |
//! | `SCHEDULER_ENABLED` | No | Toggle periodic jobs (default true) |
//! | `MODEL_DIR` | No | Baseline blob directory (default ./models) |
//! | `RUST_LOG` | No | Log filter (default info) |

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use enms_analytics::api::create_app;
use enms_analytics::config::AppConfig;
use enms_analytics::context::CoreContext;
use enms_analytics::events::{run_subscriber, EventPublisher};
use enms_analytics::limits::RateLimiter;
use enms_analytics::scheduler;
use enms_analytics::store::{self, training_jobs};

/// Grace period between the shutdown signal and forced exit.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Age after which a `running` training job left by a previous process
/// counts as stuck.
const STARTUP_STUCK_JOB_AGE_SECS: i64 = 3600;

#[derive(Parser, Debug)]
#[command(name = "enms-analytics", about = "EnMS Analytics Service")]
#[command(version)]
struct CliArgs {
    /// PostgreSQL connection URL (overrides DATABASE_URL / DB_*)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Port to listen on (default: 8000)
    #[arg(long, short)]
    port: Option<u16>,

    /// Bind address (overrides --port)
    #[arg(long)]
    bind_address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = AppConfig::from_env(args.database_url, args.bind_address, args.port)?;

    info!(bind = %config.bind_address, "Starting EnMS Analytics Service");

    // ── Store ────────────────────────────────────────────────────────────────
    let pool = store::create_pool(&config.db)
        .await
        .context("failed to open the store pool")?;
    if !store::health_check(&pool).await {
        anyhow::bail!("store health check failed — is the database reachable?");
    }
    store::run_migrations(&pool)
        .await
        .context("migrations failed")?;

    // ── Event bus ────────────────────────────────────────────────────────────
    let publisher = if config.bus.pubsub_enabled {
        EventPublisher::connect(&config.bus).await
    } else {
        info!("BUS_PUBSUB_ENABLED=false — event publishing disabled");
        EventPublisher::disabled()
    };
    let limiter = RateLimiter::connect(&config.bus.url(), config.rate_limits.clone()).await;

    let ctx = CoreContext::new(config.clone(), pool.clone(), publisher, limiter);
    let cancel = CancellationToken::new();

    // ── Subscriber (bus → WebSocket fan-out) ─────────────────────────────────
    if config.bus.pubsub_enabled {
        tokio::spawn(run_subscriber(
            config.bus.clone(),
            ctx.fanout.clone(),
            cancel.child_token(),
        ));
        info!("bus subscriber started");
    }

    // ── Stuck-job cleanup from a previous process ────────────────────────────
    match training_jobs::cleanup_stuck(&pool, STARTUP_STUCK_JOB_AGE_SECS).await {
        Ok(0) => {}
        Ok(reaped) => warn!(reaped, "marked stale training jobs as failed"),
        Err(e) => warn!(error = %e, "startup training-job cleanup failed"),
    }

    // ── Scheduler ────────────────────────────────────────────────────────────
    if config.scheduler_enabled {
        tokio::spawn(scheduler::run(ctx.clone(), cancel.child_token()));
    } else {
        info!("SCHEDULER_ENABLED=false — periodic jobs disabled");
    }

    // ── HTTP/WS listener ─────────────────────────────────────────────────────
    let app = create_app(ctx.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("cannot bind {}", config.bind_address))?;
    info!(address = %config.bind_address, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await?;

    // ── Ordered teardown ─────────────────────────────────────────────────────
    cancel.cancel();
    let open = ctx.fanout.connection_count();
    if open > 0 {
        info!(clients = open, "closing websocket clients");
        ctx.fanout.drain();
    }
    pool.close().await;
    info!("shut down cleanly");
    Ok(())
}

/// Resolve on SIGINT/SIGTERM; cancels background tasks and arms the
/// forced-exit watchdog so a wedged drain cannot hold the process open.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received — draining");
    cancel.cancel();

    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        warn!("shutdown deadline exceeded — forcing exit");
        std::process::exit(1);
    });
}

//! The Small POS offline command outbox.
//!
//! Sales are recorded locally and their remote effects queued in a durable
//! outbox; a background flusher replays the queue against the ticket API
//! once it is reachable, with idempotency keys making redelivery safe.

pub mod api;
pub mod config;
pub mod db;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod flusher;
pub mod idempotency;
pub mod mapping;
pub mod orders;
pub mod outbox;
pub mod remote;
pub mod storage;
pub mod tickets;

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::RestTicketPort;
use crate::config::AppConfig;
use crate::flusher::Flusher;

/// Structured logging to the console and to daily rolling files in
/// `log_dir`. Keep the returned guard alive; dropping it flushes the file
/// writer.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pos_outbox=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(log_dir, diagnostics::MAX_LOG_FILES);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

/// Process entry point: open storage, start the flusher, and drain the
/// outbox until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_logging(&config.log_dir);

    info!(
        "Starting The Small POS outbox v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA")
    );

    let base_url = config
        .api_base_url
        .clone()
        .context("POS_API_BASE_URL is not set")?;

    // Main connection, used for startup checks.
    let db_state = db::init(&config.data_dir).context("failed to initialize database")?;
    {
        let conn = db_state.lock()?;
        match device::resolve(&conn) {
            Ok(ctx) => info!(
                device_id = ctx.device_id(),
                business_date = %ctx.business_date(),
                "Device context loaded"
            ),
            Err(e) => warn!("Device not provisioned, new sales cannot be queued: {e}"),
        }
        let status = outbox::sync_status(&conn)?;
        info!(
            pending = status.pending,
            dead_letters = status.dead_letters,
            "Outbox loaded"
        );
    }

    let token = storage::access_token();
    if token.is_none() {
        warn!("No ticket API access token stored; requests are sent unauthenticated");
    }
    let remote = RestTicketPort::new(&base_url, config.request_timeout, token)
        .context("failed to build HTTP client")?;
    info!(base_url = remote.base_url(), "Ticket API configured");

    // Second DB connection for the background flusher
    let db_for_flush =
        Arc::new(db::init(&config.data_dir).context("failed to init flusher database")?);
    let flusher = Arc::new(Flusher::new(
        db_for_flush,
        Arc::new(remote),
        config.flush_interval,
    ));
    flusher.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    flusher.stop().await;
    if let Ok(health) = diagnostics::get_outbox_health(&db_state, flusher.last_flush_at()) {
        info!(
            pending = health.queue.pending,
            dead_letters = health.queue.dead_letters,
            "Outbox state at shutdown"
        );
    }
    Ok(())
}

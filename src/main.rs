// =============================================================================
// Candle Recorder — Main Entry Point
// =============================================================================
//
// One writer pipeline (feed supervisor -> aggregator -> candle store) and a
// read-only query server. On SIGINT/SIGTERM the feed stops, queued trades
// are drained, the in-progress candle is flushed and the snapshot written,
// all within the configured grace period.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod market_data;
mod runtime_config;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::aggregator::run_aggregator;
use crate::market_data::feed_supervisor::run_feed_supervisor;
use crate::market_data::{CandleAggregator, CandleStore, FeedStats};
use crate::runtime_config::ServiceConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Recorder starting up");

    let config_path =
        std::env::var("CANDLE_CONFIG_PATH").unwrap_or_else(|_| "candle_config.json".into());
    let config = ServiceConfig::load(&config_path)
        .unwrap_or_else(|e| {
            warn!(error = %format!("{e:#}"), "Failed to load config, using defaults");
            ServiceConfig::default()
        })
        .apply_env()
        .validated();
    let config = Arc::new(config);

    info!(
        symbol = %config.symbol,
        bucket_width_secs = config.bucket_width_secs,
        history_cap = config.history_cap,
        snapshot = %config.snapshot_path.display(),
        "configuration resolved"
    );

    // ── 2. Store & shared state ──────────────────────────────────────────
    let store = Arc::new(CandleStore::open(&config.snapshot_path, config.history_cap));
    let feed_stats = Arc::new(FeedStats::default());
    let state = Arc::new(AppState::new(config.clone(), store.clone(), feed_stats.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (trade_tx, trade_rx) = mpsc::channel(config.trade_channel_capacity);

    // ── 3. Aggregator ────────────────────────────────────────────────────
    let aggregator = match store.partial_tail() {
        Some(partial) => {
            info!(candle = %partial, "resuming partial candle from previous run");
            CandleAggregator::resume(config.bucket_width_secs, partial)
        }
        None => CandleAggregator::new(config.bucket_width_secs),
    };
    let aggregator_handle = tokio::spawn(run_aggregator(
        aggregator,
        trade_rx,
        store.clone(),
        feed_stats.clone(),
        shutdown_rx.clone(),
    ));

    // ── 4. Feed supervisor ───────────────────────────────────────────────
    let feed_handle = tokio::spawn(run_feed_supervisor(
        config.clone(),
        trade_tx,
        feed_stats.clone(),
        shutdown_rx.clone(),
    ));

    // ── 5. Query server ──────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind query server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "query server listening");

    let mut api_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        let app = api::rest::router(state);
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = api_shutdown.changed().await;
        })
        .await;
        if let Err(e) = served {
            error!(error = %e, "query server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    wait_for_shutdown().await?;
    warn!("Shutdown signal received — stopping gracefully");
    let _ = shutdown_tx.send(true);

    let grace = config.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        let _ = feed_handle.await;
        let _ = aggregator_handle.await;
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = grace.as_secs(), "pipeline did not drain in time, writing snapshot as-is");
        store.persist_now();
    }

    if tokio::time::timeout(grace, server_handle).await.is_err() {
        warn!("query server did not stop within grace period");
    }

    info!(candles = store.len(), "Candle Recorder shut down complete.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

//! Application entry point for the `airwatch-pipeline` service.
//!
//! This binary orchestrates the full startup sequence, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Validating the AQI breakpoint tables (fatal if misconfigured)
//! - Connecting to PostgreSQL and creating the schema, or falling back to
//!   the in-memory demo store when `DATABASE_URL` is unset
//! - Starting the ingestion loop over the configured reading source
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Serving until Ctrl-C, then draining in-flight ingestion work
//!
//! # Environment Variables
//! See `config::load_from_env` for the pipeline settings. Logging:
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//! - `FORCE_COLOR` (optional) – override TTY color detection
use std::{env, io::IsTerminal, net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Result};
use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use airwatch_pipeline::{
    aqi,
    config::{self, SourceKind},
    dedup::{Clock, Deduplicator, SystemClock},
    ingest::IngestionLoop,
    routes::{self, AppState},
    schema,
    sink::{BroadcastSink, FanoutSink},
    source::{HttpSource, ReadingSource, Simulator},
    store::{MemoryRepository, PgRepository, Repository},
    AirQualityService, AlertPipeline,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    aqi::validate_tables().map_err(|e| anyhow!("Refusing to start: {}", e))?;

    let repo: Arc<dyn Repository> = match &cfg.db_url {
        Some(db_url) => {
            tracing::info!("Attempting to connect to database");
            let pool = PgPoolOptions::new()
                .max_connections(cfg.db_pool_max)
                .acquire_timeout(cfg.io_timeout)
                .connect(db_url)
                .await
                .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;
            tracing::info!("Successfully connected to database");

            schema::create_schema(&pool).await?;
            Arc::new(PgRepository::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory demo store");
            Arc::new(MemoryRepository::seeded_demo_with_retention(cfg.memory_retention))
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = BroadcastSink::new(cfg.fanout_capacity);
    let sink: Arc<dyn FanoutSink> = Arc::new(events.clone());
    let dedup = Arc::new(Deduplicator::new(cfg.dedup_config()));

    let pipeline = Arc::new(AlertPipeline::new(
        repo.clone(),
        sink.clone(),
        dedup,
        clock.clone(),
        cfg.io_timeout,
    ));

    let source: Arc<dyn ReadingSource> = match &cfg.source {
        SourceKind::Simulator => Arc::new(Simulator::new(clock.clone())),
        SourceKind::Http(url) => {
            Arc::new(HttpSource::new(url.clone(), cfg.api_max_pages, cfg.io_timeout)?)
        }
    };

    let ingestion = IngestionLoop::new(
        repo.clone(),
        source,
        pipeline.clone(),
        sink.clone(),
        cfg.ingest_config(),
    )
    .spawn();

    let service = Arc::new(AirQualityService::new(repo, pipeline, sink, cfg.io_timeout));

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(AppState { service, events });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, stopping ingestion");
    ingestion.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    // ---
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `AXUM_LOG_LEVEL` env var
///
/// Call once at startup before any logging macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}

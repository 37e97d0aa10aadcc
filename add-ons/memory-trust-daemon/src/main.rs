//! Memory trust daemon
//!
//! Runs the background validator against the configured store, purges expired vault
//! records and reports telemetry on a fixed tick. Ctrl-C stops intake and waits for
//! in-flight batches before exiting.

use memory_trust::{EnvKeyProvider, MemoryPipeline, TrustConfig};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default maintenance tick (vault purge + telemetry report).
const DEFAULT_TICK_SECS: u64 = 300;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[memory-trust-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TrustConfig::load()?.normalized();
    if std::env::args().any(|a| a == "--print-config") {
        println!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let tick_secs = std::env::var("MEMTRUST_DAEMON_TICK_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TICK_SECS)
        .max(1);

    // NOTE: sled is single-writer; nothing else may open storage_path while the daemon runs.
    let pipeline = MemoryPipeline::open(config, &EnvKeyProvider::default())?;
    if !pipeline.vault().is_unlocked() {
        tracing::warn!(
            target: "memtrust::vault",
            "MEMTRUST_VAULT_KEY not set or invalid; suspicious entries will stay untrusted"
        );
    }

    let validator = pipeline.start_validator();
    tracing::info!(
        tick_secs,
        storage_path = %pipeline.config().storage_path.display(),
        entries = pipeline.store().len(),
        "memory trust daemon started"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => tick(&pipeline, validator.backlog()),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; draining in-flight batches");
                break;
            }
        }
    }

    validator.shutdown().await;
    tick(&pipeline, 0);
    pipeline.store().flush()?;
    tracing::info!("memory trust daemon stopped");
    Ok(())
}

fn tick(pipeline: &MemoryPipeline, backlog: usize) {
    if let Err(e) = pipeline.purge_expired() {
        tracing::warn!(target: "memtrust::vault", error = %e, "vault purge failed");
    }

    let snapshot = pipeline.telemetry_snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => tracing::info!(target: "memtrust::telemetry", backlog, snapshot = %json, "telemetry snapshot"),
        Err(e) => tracing::warn!(target: "memtrust::telemetry", error = %e, "telemetry snapshot not serializable"),
    }

    // Forwarding sink: one JSON line per normalized event.
    for event in pipeline.telemetry().drain_events() {
        if let Ok(json) = serde_json::to_string(&event) {
            tracing::debug!(target: "memtrust::telemetry", event = %json, "forward");
        }
    }
}

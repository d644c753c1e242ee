//! # Probe Worker Service
//!
//! Worker pool process: dequeues probe tasks, runs the configured trace
//! tool under rate and concurrency limits, and persists measurement and
//! hop rows.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin probe_worker
//! ```
//!
//! Press Ctrl+C to stop gracefully; in-flight probes drain up to the
//! configured grace window.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracemap_node::{
    database, metrics, probe_worker::WorkerPool, runtime_settings::RuntimeSettings,
    settings::Settings, target_queue::TargetQueue, SharedRuntimeSettings,
};

#[derive(Parser, Debug)]
#[command(name = "probe_worker", about = "Tracemap probe worker pool")]
struct Args {
    /// Override the worker count from the settings store.
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    #[cfg(feature = "observability")]
    tracing_subscriber::fmt().json().init();
    #[cfg(not(feature = "observability"))]
    env_logger::init();
    let args = Args::parse();

    println!("🚀 Starting Probe Worker Service");
    println!("═══════════════════════════════════════════════════════════════════\n");

    // 1. Load settings
    let settings = Arc::new(Settings::new()?);
    println!("✅ Settings loaded");

    // 2. Connect to the measurement store (fatal on failure: the
    //    supervisor restarts us)
    let db = database::connect_with(
        settings.database.max_connections,
        Duration::from_secs(settings.database.acquire_timeout_seconds),
    )
    .await?;
    println!("✅ Measurement store connected");

    // 3. Metrics
    metrics::describe_metrics();
    #[cfg(feature = "observability")]
    {
        metrics_exporter_prometheus::PrometheusBuilder::new().install()?;
        println!("✅ Prometheus exporter installed");
    }

    // 4. Runtime settings snapshot
    let runtime = Arc::new(SharedRuntimeSettings::new(
        RuntimeSettings::load_or_default(&db).await,
    ));
    let worker_count = args
        .workers
        .unwrap_or_else(|| runtime.snapshot().worker.worker_count)
        .max(1);
    println!("✅ Runtime settings loaded (worker_count: {})", worker_count);

    // 5. Target queue
    let queue = Arc::new(TargetQueue::from_settings(db.clone(), &settings.queue));
    println!("✅ Target queue ready (depth: {})", queue.depth().await?);

    // 6. Spawn workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = WorkerPool::new(db, queue, settings.clone(), runtime);
    let handles = pool.spawn(worker_count, shutdown_rx);

    println!("\n💡 Service running: {} workers. Press Ctrl+C to stop gracefully...\n", worker_count);
    signal::ctrl_c().await?;
    println!("\n🛑 Shutdown signal received, draining workers...");

    shutdown_tx.send(true).ok();
    let grace = Duration::from_secs(settings.worker.drain_grace_seconds + 5);
    for handle in handles {
        if tokio::time::timeout(grace, handle).await.is_err() {
            eprintln!("⚠️ Worker did not stop inside the grace window");
        }
    }

    println!("✅ Shutdown complete");
    Ok(())
}

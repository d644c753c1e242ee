//! # Remeasurement Scheduler Service
//!
//! Periodically re-enqueues targets whose last probe is older than the
//! configured TTL, at low priority and capped per cycle.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin remeasure_scheduler
//! cargo run --bin remeasure_scheduler -- --cycles 1
//! ```

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracemap_node::{
    database, metrics, remeasurement::RemeasurementScheduler,
    runtime_settings::RuntimeSettings, settings::Settings, target_queue::TargetQueue,
    SharedRuntimeSettings,
};

#[derive(Parser, Debug)]
#[command(name = "remeasure_scheduler", about = "Tracemap remeasurement scheduler")]
struct Args {
    /// Run this many cycles and exit instead of looping forever.
    #[arg(long)]
    cycles: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    #[cfg(feature = "observability")]
    tracing_subscriber::fmt().json().init();
    #[cfg(not(feature = "observability"))]
    env_logger::init();
    let args = Args::parse();

    println!("🚀 Starting Remeasurement Scheduler Service");
    println!("═══════════════════════════════════════════════════════════════════\n");

    // 1. Load settings
    let settings = Arc::new(Settings::new()?);
    println!("✅ Settings loaded");

    // 2. Connect to the measurement store
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

    // 4. Runtime settings + queue
    let runtime = Arc::new(SharedRuntimeSettings::new(
        RuntimeSettings::load_or_default(&db).await,
    ));
    let queue = Arc::new(TargetQueue::from_settings(db.clone(), &settings.queue));
    println!("✅ Runtime settings loaded, queue ready");

    // 5. Scheduler
    let scheduler = RemeasurementScheduler::new(db.clone(), queue, runtime.clone());
    println!("✅ Remeasurement scheduler created");

    if let Some(cycles) = args.cycles {
        for i in 1..=cycles {
            runtime.refresh(&db).await;
            let (enqueued, deduped) = scheduler.run_cycle().await?;
            println!(
                "✅ Cycle {}/{}: {} re-enqueued, {} deduped",
                i, cycles, enqueued, deduped
            );
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    println!("\n💡 Service running. Press Ctrl+C to stop gracefully...\n");
    signal::ctrl_c().await?;
    println!("\n🛑 Shutdown signal received...");

    shutdown_tx.send(true).ok();
    if tokio::time::timeout(Duration::from_secs(35), handle).await.is_err() {
        eprintln!("⚠️ Scheduler did not stop inside the grace window");
    }

    println!("✅ Shutdown complete");
    Ok(())
}

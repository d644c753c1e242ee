//! # Enrichment Engine Service
//!
//! Scans for un-enriched measurements, looks up AS metadata for every hop
//! IP through the multi-source merge procedure, and maintains the asns
//! write-through cache.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin enrichment_engine            # run forever
//! cargo run --bin enrichment_engine -- --cycles 1   # one pass (smoke test)
//! ```

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracemap_node::{
    database, enrichment::EnrichmentEngine, metrics, runtime_settings::RuntimeSettings,
    settings::Settings, SharedRuntimeSettings,
};

#[derive(Parser, Debug)]
#[command(name = "enrichment_engine", about = "Tracemap ASN enrichment engine")]
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

    println!("🚀 Starting Enrichment Engine Service");
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

    // 4. Runtime settings snapshot
    let runtime = Arc::new(SharedRuntimeSettings::new(
        RuntimeSettings::load_or_default(&db).await,
    ));
    println!("✅ Runtime settings loaded");

    // 5. Engine
    let engine = EnrichmentEngine::new(db.clone(), settings, runtime.clone())?;
    println!("✅ Enrichment engine created");

    if let Some(cycles) = args.cycles {
        for i in 1..=cycles {
            let rs = runtime.refresh(&db).await;
            let processed = engine.run_cycle(&rs).await?;
            println!("✅ Cycle {}/{}: {} measurements enriched", i, cycles, processed);
        }
        return Ok(());
    }

    // 6. Run until Ctrl+C
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        engine.run(shutdown_rx).await;
    });

    println!("\n💡 Service running. Press Ctrl+C to stop gracefully...\n");
    signal::ctrl_c().await?;
    println!("\n🛑 Shutdown signal received...");

    shutdown_tx.send(true).ok();
    if tokio::time::timeout(Duration::from_secs(35), handle).await.is_err() {
        eprintln!("⚠️ Engine did not stop inside the grace window");
    }

    println!("✅ Shutdown complete");
    Ok(())
}

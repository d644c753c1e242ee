//! # Graph Projector Service
//!
//! Projects enriched measurements into the AS-level graph, maintaining
//! per-edge observation counts and RTT bounds.
//!
//! Running more than one projector is safe (edge upserts are atomic) but
//! wasteful; deploy a single instance.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin graph_projector
//! cargo run --bin graph_projector -- --cycles 1
//! ```

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracemap_node::{database, graph_projector::GraphProjector, metrics, settings::Settings};

#[derive(Parser, Debug)]
#[command(name = "graph_projector", about = "Tracemap AS-graph projector")]
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

    println!("🚀 Starting Graph Projector Service");
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

    // 4. Projector
    let projector = GraphProjector::new(db, settings);
    println!("✅ Graph projector created");

    if let Some(cycles) = args.cycles {
        for i in 1..=cycles {
            let projected = projector.run_cycle().await?;
            println!("✅ Cycle {}/{}: {} measurements projected", i, cycles, projected);
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        projector.run(shutdown_rx).await;
    });

    println!("\n💡 Service running. Press Ctrl+C to stop gracefully...\n");
    signal::ctrl_c().await?;
    println!("\n🛑 Shutdown signal received...");

    shutdown_tx.send(true).ok();
    if tokio::time::timeout(Duration::from_secs(35), handle).await.is_err() {
        eprintln!("⚠️ Projector did not stop inside the grace window");
    }

    println!("✅ Shutdown complete");
    Ok(())
}

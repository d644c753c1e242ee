// Remeasurement scheduler - keeps the measurement history fresh.
//
// Each cycle re-reads its settings group, selects targets whose last probe
// is older than the TTL (oldest first, capped by the batch limit) and
// re-enqueues them at low priority so fresh producer traffic always wins.

use crate::database::{self, DbPool};
use crate::metrics;
use crate::runtime_settings::SharedRuntimeSettings;
use crate::target_queue::{EnqueueOutcome, TargetQueue};
use crate::types::{TaskPriority, TaskSource};
use anyhow::Result;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

pub struct RemeasurementScheduler {
    db: DbPool,
    queue: Arc<TargetQueue>,
    runtime: Arc<SharedRuntimeSettings>,
}

impl RemeasurementScheduler {
    pub fn new(db: DbPool, queue: Arc<TargetQueue>, runtime: Arc<SharedRuntimeSettings>) -> Self {
        Self { db, queue, runtime }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("🚀 Remeasurement scheduler started");
        while !*shutdown.borrow() {
            let rs = self.runtime.refresh(&self.db).await;
            match self.run_cycle().await {
                Ok((enqueued, deduped)) => {
                    if enqueued > 0 || deduped > 0 {
                        info!(
                            "✅ Remeasurement cycle: {} re-enqueued, {} deduped",
                            enqueued, deduped
                        );
                    }
                }
                Err(e) => {
                    error!("❌ Remeasurement cycle failed: {}", e);
                }
            }
            let interval = Duration::from_secs(rs.remeasurement.interval_seconds.max(1));
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("✅ Remeasurement scheduler stopped");
    }

    /// One scheduler pass. Returns (enqueued, deduped).
    pub async fn run_cycle(&self) -> Result<(usize, usize)> {
        let rs = self.runtime.snapshot();
        let ttl = Duration::from_secs(rs.remeasurement.ttl_seconds);
        let stale = database::stale_targets(&self.db, ttl, rs.remeasurement.batch_limit).await?;
        if stale.is_empty() {
            return Ok((0, 0));
        }

        let mut enqueued = 0usize;
        let mut deduped = 0usize;
        for target in &stale {
            let Ok(ip) = target.target_ip.parse() else {
                warn!("⚠️ Skipping stored target with invalid IP '{}'", target.target_ip);
                continue;
            };
            match self
                .queue
                .enqueue(ip, TaskSource::Remeasure, TaskPriority::Low, None)
                .await
            {
                Ok(EnqueueOutcome::Accepted) => enqueued += 1,
                Ok(EnqueueOutcome::Deduped) => deduped += 1,
                Err(e) => {
                    warn!("⚠️ Re-enqueue of {} failed: {}", ip, e);
                }
            }
        }
        metrics::record_remeasure_enqueued(enqueued as u64);
        Ok((enqueued, deduped))
    }
}

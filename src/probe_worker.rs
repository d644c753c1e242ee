// Probe worker pool - turns queue tasks into measurement + hop rows.
//
// Each worker is a long-lived task: dequeue, take a rate-window slot, take a
// concurrency permit, reserve the measurement row, run the probe subprocess
// under a timeout, parse, persist. Failures never kill the worker; a failed
// probe is recorded with success=false and the loop moves on.

use crate::database::{self, DbPool};
use crate::metrics;
use crate::probe_parser::{self, non_timeout_hop_count};
use crate::probe_tools::{self, ToolError, TraceTool};
use crate::rate_limit::RateWindow;
use crate::runtime_settings::SharedRuntimeSettings;
use crate::settings::Settings;
use crate::target_queue::TargetQueue;
use crate::types::ProbeTask;
use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use rand::Rng;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Instant};

pub struct WorkerPool {
    db: DbPool,
    queue: Arc<TargetQueue>,
    settings: Arc<Settings>,
    runtime: Arc<SharedRuntimeSettings>,
}

impl WorkerPool {
    pub fn new(
        db: DbPool,
        queue: Arc<TargetQueue>,
        settings: Arc<Settings>,
        runtime: Arc<SharedRuntimeSettings>,
    ) -> Self {
        Self {
            db,
            queue,
            settings,
            runtime,
        }
    }

    /// Spawn `count` workers. Each runs until the shutdown signal flips,
    /// then drains its in-flight probes up to the configured grace window.
    pub fn spawn(&self, count: usize, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        info!("🚀 Starting worker pool with {} workers", count);
        (0..count)
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    db: self.db.clone(),
                    queue: self.queue.clone(),
                    settings: self.settings.clone(),
                    runtime: self.runtime.clone(),
                    rate: Arc::new(RateWindow::per_minute()),
                };
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker.run_loop(shutdown).await;
                })
            })
            .collect()
    }
}

struct Worker {
    worker_id: usize,
    db: DbPool,
    queue: Arc<TargetQueue>,
    settings: Arc<Settings>,
    runtime: Arc<SharedRuntimeSettings>,
    rate: Arc<RateWindow>,
}

impl Worker {
    async fn run_loop(&self, shutdown: watch::Receiver<bool>) {
        let dequeue_timeout = Duration::from_secs(self.settings.worker.dequeue_timeout_seconds);
        let tool_backoff = Duration::from_secs(self.settings.worker.tool_backoff_seconds);

        let mut inflight: JoinSet<()> = JoinSet::new();
        let mut semaphore_capacity = self.runtime.snapshot().worker.max_concurrent_probes.max(1);
        let mut semaphore = Arc::new(Semaphore::new(semaphore_capacity));

        info!("👷 Worker {} started", self.worker_id);

        while !*shutdown.borrow() {
            // Reap finished probes without blocking
            while inflight.try_join_next().is_some() {}

            let rs = self.runtime.snapshot();

            // Concurrency cap follows the settings store. Probes already in
            // flight keep their old permits; only new probes see the change.
            let wanted = rs.worker.max_concurrent_probes.max(1);
            if wanted != semaphore_capacity {
                info!(
                    "Worker {}: max_concurrent_probes {} -> {}",
                    self.worker_id, semaphore_capacity, wanted
                );
                semaphore_capacity = wanted;
                semaphore = Arc::new(Semaphore::new(wanted));
            }

            let tool = match probe_tools::select_tool(&rs.worker.tool_preference) {
                Ok(tool) => tool,
                Err(ToolError::NoToolAvailable) => {
                    // Jitter keeps a fleet of workers from re-checking in
                    // lockstep after a tool package reinstall
                    let backoff = tool_backoff
                        + Duration::from_millis(rand::thread_rng().gen_range(0..2000));
                    warn!(
                        "⚠️ Worker {}: no probe tool available, backing off {:?}",
                        self.worker_id, backoff
                    );
                    sleep(backoff).await;
                    continue;
                }
                Err(e) => {
                    error!("❌ Worker {}: tool selection failed: {}", self.worker_id, e);
                    sleep(tool_backoff).await;
                    continue;
                }
            };

            let task = match self.queue.dequeue(dequeue_timeout).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    // Idle: refresh settings and do queue housekeeping
                    self.runtime.refresh(&self.db).await;
                    if let Err(e) = self.queue.maintain().await {
                        warn!("⚠️ Worker {}: queue maintenance failed: {}", self.worker_id, e);
                    }
                    continue;
                }
                Err(e) => {
                    error!("❌ Worker {}: dequeue failed: {}", self.worker_id, e);
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            self.rate.acquire(rs.worker.rate_limit_per_minute).await;

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // semaphore closed, shutting down
            };

            let probe = ProbeJob {
                worker_id: self.worker_id,
                db: self.db.clone(),
                queue: self.queue.clone(),
                tool,
                task,
                probe_timeout: Duration::from_secs(rs.worker.probe_timeout_seconds),
                mtr_sample_count: self.settings.worker.mtr_sample_count,
            };
            inflight.spawn(async move {
                let _permit = permit;
                probe.run().await;
            });
        }

        // Drain in-flight probes up to the grace window, then abort.
        let grace = Duration::from_secs(self.settings.worker.drain_grace_seconds);
        info!(
            "🛑 Worker {} draining {} in-flight probes (grace {:?})",
            self.worker_id,
            inflight.len(),
            grace
        );
        let deadline = Instant::now() + grace;
        while !inflight.is_empty() {
            match timeout_at(deadline, inflight.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "⚠️ Worker {}: grace window elapsed, aborting {} probes",
                        self.worker_id,
                        inflight.len()
                    );
                    inflight.abort_all();
                    break;
                }
            }
        }
        info!("✅ Worker {} stopped", self.worker_id);
    }
}

struct ProbeJob {
    worker_id: usize,
    db: DbPool,
    queue: Arc<TargetQueue>,
    tool: TraceTool,
    task: ProbeTask,
    probe_timeout: Duration,
    mtr_sample_count: u32,
}

/// Outcome of one subprocess run: captured stdout (possibly partial on
/// timeout) and the exit code when the process finished in time.
struct ProbeRun {
    raw_output: String,
    exit_code: Option<i32>,
    timed_out: bool,
}

impl ProbeJob {
    async fn run(self) {
        let target_ip = self.task.target_ip;
        debug!(
            "Worker {}: probing {} with {} (source: {})",
            self.worker_id, target_ip, self.tool, self.task.source
        );

        // Reserve the measurement id first; the row is the idempotency
        // anchor for at-least-once queue delivery.
        let target_id = match database::upsert_target(&self.db, &target_ip, self.task.source).await
        {
            Ok(id) => id,
            Err(e) => {
                error!("❌ Worker {}: target upsert failed for {}: {}", self.worker_id, target_ip, e);
                return;
            }
        };
        let started_at = Utc::now();
        let measurement_id = match database::insert_measurement(
            &self.db,
            target_id,
            self.tool.binary_name(),
            started_at,
        )
        .await
        {
            Ok(id) => id,
            Err(e) => {
                // Not re-enqueued here; the remeasurement loop covers it.
                error!(
                    "❌ Worker {}: failed to reserve measurement for {}: {}",
                    self.worker_id, target_ip, e
                );
                return;
            }
        };

        if let Err(e) = self.queue.ack(self.task.id).await {
            warn!("⚠️ Worker {}: ack of task {} failed: {}", self.worker_id, self.task.id, e);
        }

        metrics::increment_probes_launched(self.tool.binary_name());
        let run = self.execute_subprocess(&target_ip).await;

        let hops = match &run {
            Ok(run) => probe_parser::parse_output(self.tool, &run.raw_output),
            Err(_) => Vec::new(),
        };
        let (raw_output, exit_code, timed_out) = match run {
            Ok(run) => (run.raw_output, run.exit_code, run.timed_out),
            Err(e) => {
                warn!(
                    "⚠️ Worker {}: {} subprocess failed for {}: {}",
                    self.worker_id, self.tool, target_ip, e
                );
                (String::new(), None, false)
            }
        };

        let success = !timed_out && exit_code == Some(0) && non_timeout_hop_count(&hops) >= 1;
        if timed_out {
            metrics::increment_probe_failures("timeout");
        } else if !success {
            metrics::increment_probe_failures("unsuccessful");
        }

        if let Err(e) = database::insert_hops(&self.db, measurement_id, &hops).await {
            error!(
                "❌ Worker {}: hop write failed for measurement {}: {}",
                self.worker_id, measurement_id, e
            );
            return;
        }
        let completed_at = Utc::now();
        if let Err(e) = database::complete_measurement(
            &self.db,
            measurement_id,
            completed_at,
            success,
            &raw_output,
        )
        .await
        {
            error!(
                "❌ Worker {}: completion write failed for measurement {}: {}",
                self.worker_id, measurement_id, e
            );
            return;
        }
        if let Err(e) =
            database::touch_target_last_measurement(&self.db, target_id, completed_at).await
        {
            warn!("⚠️ Worker {}: target touch failed: {}", self.worker_id, e);
        }

        metrics::record_hops_persisted(hops.len() as u64);
        info!(
            "📡 Worker {}: {} -> measurement {} ({} hops, success: {})",
            self.worker_id,
            target_ip,
            measurement_id,
            hops.len(),
            success
        );
    }

    /// Run the tool bounded by the probe timeout, streaming stdout line by
    /// line so a timed-out probe still keeps the hops parsed so far.
    async fn execute_subprocess(&self, target_ip: &std::net::IpAddr) -> Result<ProbeRun> {
        let mut cmd = self.tool.command(target_ip, self.mtr_sample_count);
        cmd.stdout(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("probe subprocess has no stdout"))?;

        let deadline = Instant::now() + self.probe_timeout;
        let mut lines = BufReader::new(stdout).lines();
        let mut raw_output = String::new();
        let mut timed_out = false;

        loop {
            match timeout_at(deadline, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    raw_output.push_str(&line);
                    raw_output.push('\n');
                }
                Ok(Ok(None)) => break, // EOF
                Ok(Err(e)) => {
                    warn!("⚠️ Error reading {} stdout: {}", self.tool, e);
                    break;
                }
                Err(_) => {
                    timed_out = true;
                    child.start_kill().ok();
                    break;
                }
            }
        }

        let exit_code = if timed_out {
            // Make sure the child is reaped, but don't wait on it forever
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
            None
        } else {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(e)) => {
                    warn!("⚠️ Waiting on {} failed: {}", self.tool, e);
                    None
                }
                Err(_) => {
                    timed_out = true;
                    child.start_kill().ok();
                    None
                }
            }
        };

        Ok(ProbeRun {
            raw_output,
            exit_code,
            timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The success rule: exit 0 AND at least one non-timeout hop.
    fn success_of(exit_code: Option<i32>, timed_out: bool, hops: &[crate::types::ParsedHop]) -> bool {
        !timed_out && exit_code == Some(0) && non_timeout_hop_count(hops) >= 1
    }

    fn hop(n: i32, ip: Option<&str>) -> crate::types::ParsedHop {
        crate::types::ParsedHop {
            hop_number: n,
            ip: ip.map(|s| s.parse().unwrap()),
            rtt_ms: ip.map(|_| 1.0),
        }
    }

    #[test]
    fn test_success_requires_responding_hop() {
        assert!(success_of(Some(0), false, &[hop(1, Some("10.0.0.1"))]));
        // Probe completed but every hop timed out
        assert!(!success_of(Some(0), false, &[hop(1, None), hop(2, None)]));
        // Zero hops (network unreachable at hop 1)
        assert!(!success_of(Some(0), false, &[]));
        // Non-zero exit
        assert!(!success_of(Some(1), false, &[hop(1, Some("10.0.0.1"))]));
        // Timeout, even with parsed hops
        assert!(!success_of(None, true, &[hop(1, Some("10.0.0.1"))]));
    }

    #[tokio::test]
    async fn test_subprocess_capture_with_fake_tool() {
        // Stand in a fake traceroute that emits two hops
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("traceroute");
        std::fs::write(
            &fake,
            "#!/bin/sh\necho 'traceroute to 1.1.1.1'\necho ' 1  192.168.1.1  0.400 ms'\necho ' 2  1.1.1.1  9.900 ms'\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut cmd = tokio::process::Command::new(&fake);
        cmd.stdout(Stdio::piped());
        let mut child = cmd.spawn().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let mut raw = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            raw.push_str(&line);
            raw.push('\n');
        }
        let status = child.wait().await.unwrap();

        let hops = probe_parser::parse_output(TraceTool::Traceroute, &raw);
        assert_eq!(hops.len(), 2);
        assert!(success_of(status.code(), false, &hops));
    }
}

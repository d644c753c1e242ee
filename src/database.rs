use crate::types::{ParsedHop, TaskPriority, TaskSource};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, Row};
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Database schema name.
pub const SCHEMA: &str = "tracemap";

/// One measurement selected for enrichment or projection.
#[derive(Debug, Clone)]
pub struct MeasurementBatchItem {
    pub id: i64,
    pub completed_at: Option<DateTime<Utc>>,
    pub enrichment_attempts: i32,
}

/// A persisted hop row, with whatever enrichment has landed so far.
#[derive(Debug, Clone)]
pub struct HopRow {
    pub measurement_id: i64,
    pub hop_number: i32,
    pub hop_ip: Option<String>,
    pub rtt_ms: Option<f64>,
    pub asn: Option<i64>,
}

/// Full cached AS record from the asns table.
#[derive(Debug, Clone)]
pub struct CachedAsn {
    pub asn: i64,
    pub org_name: Option<String>,
    pub country_code: Option<String>,
    pub prefix: Option<String>,
    pub source: Option<String>,
    pub last_enriched: Option<DateTime<Utc>>,
    pub last_enrichment_attempt: Option<DateTime<Utc>>,
}

/// Merged record written through to the asns cache after a lookup round.
#[derive(Debug, Clone, Default)]
pub struct AsnUpsert {
    pub asn: i64,
    pub org_name: Option<String>,
    pub country_code: Option<String>,
    pub prefix: Option<String>,
    /// Which source supplied the core (non-PeeringDB) fields.
    pub source: Option<String>,
    pub peeringdb_id: Option<i64>,
    pub facility_count: Option<i32>,
    pub peering_policy: Option<String>,
    pub traffic_levels: Option<String>,
    pub irr_as_set: Option<String>,
    pub prefix_count: Option<i32>,
    pub neighbor_count: Option<i32>,
    /// Number of measurements in this batch that observed the ASN.
    pub measurement_count: i64,
    /// Mean RTT over this batch's hops for the ASN, if any hop carried one.
    pub batch_avg_rtt_ms: Option<f64>,
    /// False for cache hits: stats refresh but `last_enriched` stays put.
    pub freshly_enriched: bool,
}

/// A target due for remeasurement.
#[derive(Debug, Clone)]
pub struct StaleTarget {
    pub target_ip: String,
    pub last_measurement_at: Option<DateTime<Utc>>,
}

pub async fn connect() -> Result<DbPool> {
    connect_with(5, Duration::from_secs(5)).await
}

pub async fn connect_with(max_connections: u32, acquire_timeout: Duration) -> Result<DbPool> {
    let database_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    // Retries with exponential backoff to survive DNS/startup races when the
    // store and the node come up together under a supervisor.
    let mut last_err: Option<anyhow::Error> = None;
    let max_attempts: u32 = 10;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(&database_url)
            .await
        {
            Ok(pool) => {
                info!(
                    "✅ Connected to measurement store (attempt {}/{})",
                    attempt, max_attempts
                );
                if let Err(e) = initialize_database(&pool).await {
                    last_err = Some(e);
                } else {
                    return Ok(pool);
                }
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }
        let delay_ms = (1u64 << attempt.min(6)) * 200; // 400ms, 800ms, ... capped ~12.8s
        warn!(
            "DB connect/init attempt {}/{} failed. Retrying in {} ms...",
            attempt, max_attempts, delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Unknown DB connection error")))
}

pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x545243454D415031; // "TRCEMAP1"

    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    let tables_exist = sqlx::query(&format!(
        "SELECT COUNT(*) as count FROM information_schema.tables
             WHERE table_schema = '{}'
             AND table_name IN ('targets', 'measurements', 'hops', 'asns', 'settings', 'task_queue')",
        SCHEMA
    ))
    .fetch_one(tx.as_mut())
    .await?
    .try_get::<i64, _>("count")?
        >= 6;

    if tables_exist {
        info!("✅ Measurement store schema already exists. Ensuring it is up to date.");
        create_tables(&mut tx).await?;
    } else {
        info!("📝 Creating measurement store schema for the first time...");
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
            .execute(tx.as_mut())
            .await?;
        create_tables(&mut tx).await?;

        sqlx::query(&format!(
            "INSERT INTO {}.settings (key, value) VALUES
                ('db_initialized', 'true'::jsonb),
                ('node_version', '\"0.1.0\"'::jsonb)
             ON CONFLICT (key) DO NOTHING",
            SCHEMA
        ))
        .execute(tx.as_mut())
        .await?;
        info!("✅ Measurement store schema created successfully!");
    }

    tx.commit().await?;
    Ok(())
}

async fn create_tables(tx: &mut sqlx::Transaction<'_, Postgres>) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.targets (
            id SERIAL PRIMARY KEY,
            target_ip VARCHAR(45) UNIQUE NOT NULL,
            source VARCHAR(16) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_measurement_at TIMESTAMPTZ
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.task_queue (
            id BIGSERIAL PRIMARY KEY,
            target_ip VARCHAR(45) NOT NULL,
            source VARCHAR(16) NOT NULL,
            priority SMALLINT NOT NULL DEFAULT 1,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deadline TIMESTAMPTZ,
            claimed_at TIMESTAMPTZ
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_task_queue_pending
             ON {}.task_queue (priority DESC, created_at ASC)
             WHERE claimed_at IS NULL",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.measurements (
            id BIGSERIAL PRIMARY KEY,
            target_id INTEGER NOT NULL REFERENCES {}.targets(id),
            tool VARCHAR(16) NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ,
            success BOOLEAN NOT NULL DEFAULT FALSE,
            raw_output TEXT,
            enriched BOOLEAN NOT NULL DEFAULT FALSE,
            enriched_at TIMESTAMPTZ,
            enrichment_attempts INTEGER NOT NULL DEFAULT 0,
            graph_built BOOLEAN NOT NULL DEFAULT FALSE,
            graph_built_at TIMESTAMPTZ
        )",
        SCHEMA, SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_measurements_unenriched
             ON {}.measurements (completed_at ASC)
             WHERE enriched = FALSE AND completed_at IS NOT NULL",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_measurements_unprojected
             ON {}.measurements (completed_at ASC)
             WHERE enriched = TRUE AND graph_built = FALSE",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.hops (
            id BIGSERIAL PRIMARY KEY,
            measurement_id BIGINT NOT NULL REFERENCES {}.measurements(id) ON DELETE CASCADE,
            hop_number INTEGER NOT NULL CHECK (hop_number >= 1),
            hop_ip VARCHAR(45),
            rtt_ms DOUBLE PRECISION,
            asn BIGINT,
            prefix VARCHAR(64),
            org_name TEXT,
            country_code VARCHAR(2),
            UNIQUE (measurement_id, hop_number)
        )",
        SCHEMA, SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.asns (
            asn BIGINT PRIMARY KEY,
            org_name TEXT,
            country_code VARCHAR(2),
            prefix CIDR,
            source VARCHAR(16),
            peeringdb_id BIGINT,
            facility_count INTEGER,
            peering_policy VARCHAR(32),
            traffic_levels VARCHAR(64),
            irr_as_set VARCHAR(128),
            prefix_count INTEGER,
            neighbor_count INTEGER,
            total_measurements BIGINT NOT NULL DEFAULT 0,
            avg_rtt_ms DOUBLE PRECISION,
            first_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_enriched TIMESTAMPTZ,
            last_enrichment_attempt TIMESTAMPTZ
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    // Additive migrations for nodes upgrading in place
    sqlx::query(&format!(
        "ALTER TABLE {}.asns ADD COLUMN IF NOT EXISTS prefix_count INTEGER",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await
    .ok();
    sqlx::query(&format!(
        "ALTER TABLE {}.asns ADD COLUMN IF NOT EXISTS neighbor_count INTEGER",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await
    .ok();

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.settings (
            key VARCHAR(128) PRIMARY KEY,
            value JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.as_nodes (
            asn BIGINT PRIMARY KEY,
            org_name TEXT,
            country_code VARCHAR(2),
            first_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.as_edges (
            src_asn BIGINT NOT NULL,
            dst_asn BIGINT NOT NULL,
            observed_count BIGINT NOT NULL DEFAULT 0,
            min_rtt_ms DOUBLE PRECISION,
            max_rtt_ms DOUBLE PRECISION,
            first_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (src_asn, dst_asn)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Create the target on first sight, returning its id. The `DO UPDATE`
/// no-op makes the statement return the id on conflict as well.
pub async fn upsert_target(pool: &DbPool, ip: &IpAddr, source: TaskSource) -> Result<i32> {
    let row = sqlx::query(&format!(
        "INSERT INTO {}.targets (target_ip, source)
             VALUES ($1, $2)
             ON CONFLICT (target_ip) DO UPDATE SET target_ip = EXCLUDED.target_ip
             RETURNING id",
        SCHEMA
    ))
    .bind(ip.to_string())
    .bind(source.as_str())
    .fetch_one(pool)
    .await?;
    Ok(row.try_get("id")?)
}

pub async fn touch_target_last_measurement(
    pool: &DbPool,
    target_id: i32,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE {}.targets SET last_measurement_at = GREATEST(COALESCE(last_measurement_at, $2), $2)
             WHERE id = $1",
        SCHEMA
    ))
    .bind(target_id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Targets whose last probe is older than `ttl` (or never probed but created
/// before the TTL horizon), oldest first.
pub async fn stale_targets(pool: &DbPool, ttl: Duration, limit: i64) -> Result<Vec<StaleTarget>> {
    let horizon = Utc::now()
        - ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(86400));
    let rows = sqlx::query(&format!(
        "SELECT target_ip, last_measurement_at FROM {}.targets
             WHERE COALESCE(last_measurement_at, created_at) < $1
             ORDER BY COALESCE(last_measurement_at, created_at) ASC
             LIMIT $2",
        SCHEMA
    ))
    .bind(horizon)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| StaleTarget {
            target_ip: r.get("target_ip"),
            last_measurement_at: r.get("last_measurement_at"),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Task queue
// ---------------------------------------------------------------------------

/// Append a task unless an identical pending one exists inside the dedupe
/// window. Returns true if a row was inserted.
pub async fn enqueue_task(
    pool: &DbPool,
    ip: &IpAddr,
    source: TaskSource,
    priority: TaskPriority,
    deadline: Option<DateTime<Utc>>,
    dedupe_window: Duration,
) -> Result<bool> {
    let result = sqlx::query(&format!(
        "INSERT INTO {}.task_queue (target_ip, source, priority, deadline)
             SELECT $1, $2, $3, $4
             WHERE NOT EXISTS (
                 SELECT 1 FROM {}.task_queue
                 WHERE target_ip = $1 AND source = $2 AND priority = $3
                   AND claimed_at IS NULL
                   AND created_at > NOW() - make_interval(secs => $5)
             )",
        SCHEMA, SCHEMA
    ))
    .bind(ip.to_string())
    .bind(source.as_str())
    .bind(priority.as_i16())
    .bind(deadline)
    .bind(dedupe_window.as_secs_f64())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Claim the next pending task: strict priority, FIFO within a class.
/// `SKIP LOCKED` keeps concurrent workers from serializing on the head row.
pub async fn claim_next_task(pool: &DbPool) -> Result<Option<crate::types::ProbeTask>> {
    let row = sqlx::query(&format!(
        "UPDATE {}.task_queue SET claimed_at = NOW()
             WHERE id = (
                 SELECT id FROM {}.task_queue
                 WHERE claimed_at IS NULL
                   AND (deadline IS NULL OR deadline > NOW())
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, target_ip, source, priority, created_at, deadline",
        SCHEMA, SCHEMA
    ))
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let ip_text: String = row.get("target_ip");
    let source_text: String = row.get("source");
    let task = crate::types::ProbeTask {
        id: row.get("id"),
        target_ip: IpAddr::from_str(&ip_text)
            .map_err(|_| anyhow::anyhow!("invalid target_ip in queue: {}", ip_text))?,
        source: TaskSource::from_str(&source_text)
            .map_err(|e| anyhow::anyhow!("invalid source in queue: {}", e))?,
        priority: TaskPriority::from_i16(row.get::<i16, _>("priority")),
        created_at: row.get("created_at"),
        deadline: row.get("deadline"),
    };
    Ok(Some(task))
}

pub async fn ack_task(pool: &DbPool, task_id: i64) -> Result<()> {
    sqlx::query(&format!("DELETE FROM {}.task_queue WHERE id = $1", SCHEMA))
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Release tasks claimed longer than `visibility_timeout` ago (a worker
/// crashed mid-probe). Returns how many were made claimable again.
pub async fn requeue_stale_tasks(pool: &DbPool, visibility_timeout: Duration) -> Result<u64> {
    let result = sqlx::query(&format!(
        "UPDATE {}.task_queue SET claimed_at = NULL
             WHERE claimed_at IS NOT NULL
               AND claimed_at < NOW() - make_interval(secs => $1)",
        SCHEMA
    ))
    .bind(visibility_timeout.as_secs_f64())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Drop pending tasks whose deadline has already passed.
pub async fn expire_dead_tasks(pool: &DbPool) -> Result<u64> {
    let result = sqlx::query(&format!(
        "DELETE FROM {}.task_queue WHERE claimed_at IS NULL AND deadline IS NOT NULL AND deadline <= NOW()",
        SCHEMA
    ))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn queue_depth(pool: &DbPool) -> Result<i64> {
    let row = sqlx::query(&format!(
        "SELECT COUNT(*) as count FROM {}.task_queue WHERE claimed_at IS NULL",
        SCHEMA
    ))
    .fetch_one(pool)
    .await?;
    Ok(row.try_get("count")?)
}

/// Age of the oldest pending task, in seconds. Drives the backlog gauge.
pub async fn oldest_pending_age_seconds(pool: &DbPool) -> Result<Option<f64>> {
    let row = sqlx::query(&format!(
        "SELECT EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::float8 as age
             FROM {}.task_queue WHERE claimed_at IS NULL",
        SCHEMA
    ))
    .fetch_one(pool)
    .await?;
    Ok(row.try_get("age")?)
}

// ---------------------------------------------------------------------------
// Measurements and hops
// ---------------------------------------------------------------------------

/// Reserve a measurement id before the probe subprocess is spawned. Rows
/// start with `success = false`; a crash mid-probe leaves `completed_at`
/// NULL and the enricher ignores the row.
pub async fn insert_measurement(
    pool: &DbPool,
    target_id: i32,
    tool: &str,
    started_at: DateTime<Utc>,
) -> Result<i64> {
    let row = sqlx::query(&format!(
        "INSERT INTO {}.measurements (target_id, tool, started_at, success)
             VALUES ($1, $2, $3, FALSE)
             RETURNING id",
        SCHEMA
    ))
    .bind(target_id)
    .bind(tool)
    .bind(started_at)
    .fetch_one(pool)
    .await?;
    Ok(row.try_get("id")?)
}

pub async fn complete_measurement(
    pool: &DbPool,
    measurement_id: i64,
    completed_at: DateTime<Utc>,
    success: bool,
    raw_output: &str,
) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE {}.measurements
             SET completed_at = $2, success = $3, raw_output = $4
             WHERE id = $1",
        SCHEMA
    ))
    .bind(measurement_id)
    .bind(completed_at)
    .bind(success)
    .bind(raw_output)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist all hops of a measurement in one round trip.
pub async fn insert_hops(pool: &DbPool, measurement_id: i64, hops: &[ParsedHop]) -> Result<()> {
    if hops.is_empty() {
        return Ok(());
    }
    let mut numbers: Vec<i32> = Vec::with_capacity(hops.len());
    let mut ips: Vec<Option<String>> = Vec::with_capacity(hops.len());
    let mut rtts: Vec<Option<f64>> = Vec::with_capacity(hops.len());
    for hop in hops {
        numbers.push(hop.hop_number);
        ips.push(hop.ip.map(|ip| ip.to_string()));
        rtts.push(hop.rtt_ms);
    }
    sqlx::query(&format!(
        "INSERT INTO {}.hops (measurement_id, hop_number, hop_ip, rtt_ms)
             SELECT $1::int8, * FROM UNNEST($2::int4[], $3::text[], $4::float8[])
             ON CONFLICT (measurement_id, hop_number) DO NOTHING",
        SCHEMA
    ))
    .bind(measurement_id)
    .bind(&numbers)
    .bind(&ips)
    .bind(&rtts)
    .execute(pool)
    .await?;
    Ok(())
}

/// Completed measurements not yet enriched, oldest first.
pub async fn fetch_unenriched(pool: &DbPool, batch_size: i64) -> Result<Vec<MeasurementBatchItem>> {
    let rows = sqlx::query(&format!(
        "SELECT id, completed_at, enrichment_attempts FROM {}.measurements
             WHERE enriched = FALSE AND completed_at IS NOT NULL
             ORDER BY completed_at ASC
             LIMIT $1",
        SCHEMA
    ))
    .bind(batch_size)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| MeasurementBatchItem {
            id: r.get("id"),
            completed_at: r.get("completed_at"),
            enrichment_attempts: r.get("enrichment_attempts"),
        })
        .collect())
}

/// Enriched measurements the graph projector has not consumed yet.
pub async fn fetch_enriched_unprojected(
    pool: &DbPool,
    batch_size: i64,
) -> Result<Vec<MeasurementBatchItem>> {
    let rows = sqlx::query(&format!(
        "SELECT id, completed_at, enrichment_attempts FROM {}.measurements
             WHERE enriched = TRUE AND graph_built = FALSE
             ORDER BY completed_at ASC
             LIMIT $1",
        SCHEMA
    ))
    .bind(batch_size)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| MeasurementBatchItem {
            id: r.get("id"),
            completed_at: r.get("completed_at"),
            enrichment_attempts: r.get("enrichment_attempts"),
        })
        .collect())
}

pub async fn fetch_hops_for_measurements(
    pool: &DbPool,
    measurement_ids: &[i64],
) -> Result<Vec<HopRow>> {
    if measurement_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(&format!(
        "SELECT measurement_id, hop_number, hop_ip, rtt_ms, asn FROM {}.hops
             WHERE measurement_id = ANY($1)
             ORDER BY measurement_id ASC, hop_number ASC",
        SCHEMA
    ))
    .bind(measurement_ids)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| HopRow {
            measurement_id: r.get("measurement_id"),
            hop_number: r.get("hop_number"),
            hop_ip: r.get("hop_ip"),
            rtt_ms: r.get("rtt_ms"),
            asn: r.get("asn"),
        })
        .collect())
}

/// Write one IP's enrichment result across every hop row in the batch that
/// observed it. Only the enricher calls this.
pub async fn update_hops_enrichment(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    measurement_ids: &[i64],
    hop_ip: &str,
    asn: Option<i64>,
    prefix: Option<&str>,
    org_name: Option<&str>,
    country_code: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(&format!(
        "UPDATE {}.hops
             SET asn = $3, prefix = $4, org_name = $5, country_code = $6
             WHERE measurement_id = ANY($1) AND hop_ip = $2",
        SCHEMA
    ))
    .bind(measurement_ids)
    .bind(hop_ip)
    .bind(asn)
    .bind(prefix)
    .bind(org_name)
    .bind(country_code)
    .execute(tx.as_mut())
    .await?;
    Ok(result.rows_affected())
}

/// Flip `enriched` for a set of measurements. Monotonic: rows already
/// enriched are left untouched.
pub async fn mark_enriched(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    measurement_ids: &[i64],
    at: DateTime<Utc>,
) -> Result<u64> {
    if measurement_ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query(&format!(
        "UPDATE {}.measurements SET enriched = TRUE, enriched_at = $2
             WHERE id = ANY($1) AND enriched = FALSE",
        SCHEMA
    ))
    .bind(measurement_ids)
    .bind(at)
    .execute(tx.as_mut())
    .await?;
    Ok(result.rows_affected())
}

pub async fn increment_enrichment_attempts(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    measurement_ids: &[i64],
) -> Result<()> {
    if measurement_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(&format!(
        "UPDATE {}.measurements SET enrichment_attempts = enrichment_attempts + 1
             WHERE id = ANY($1)",
        SCHEMA
    ))
    .bind(measurement_ids)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub async fn mark_graph_built(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    measurement_id: i64,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE {}.measurements SET graph_built = TRUE, graph_built_at = $2
             WHERE id = $1 AND graph_built = FALSE",
        SCHEMA
    ))
    .bind(measurement_id)
    .bind(at)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// ASN cache
// ---------------------------------------------------------------------------

/// Longest-prefix cache hit for an IP, honoring the positive TTL. A hit
/// short-circuits every external source for the cycle.
pub async fn cached_asn_for_ip(
    pool: &DbPool,
    ip: &IpAddr,
    ttl: Duration,
) -> Result<Option<CachedAsn>> {
    let horizon = Utc::now()
        - ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(7));
    let row = sqlx::query(&format!(
        "SELECT asn, org_name, country_code, prefix::text as prefix, source,
                last_enriched, last_enrichment_attempt
             FROM {}.asns
             WHERE prefix >>= $1::inet
               AND last_enriched IS NOT NULL AND last_enriched > $2
             ORDER BY masklen(prefix) DESC
             LIMIT 1",
        SCHEMA
    ))
    .bind(ip.to_string())
    .bind(horizon)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| CachedAsn {
        asn: r.get("asn"),
        org_name: r.get("org_name"),
        country_code: r.get("country_code"),
        prefix: r.get("prefix"),
        source: r.get("source"),
        last_enriched: r.get("last_enriched"),
        last_enrichment_attempt: r.get("last_enrichment_attempt"),
    }))
}

pub async fn get_asn(pool: &DbPool, asn: i64) -> Result<Option<CachedAsn>> {
    let row = sqlx::query(&format!(
        "SELECT asn, org_name, country_code, prefix::text as prefix, source,
                last_enriched, last_enrichment_attempt
             FROM {}.asns WHERE asn = $1",
        SCHEMA
    ))
    .bind(asn)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| CachedAsn {
        asn: r.get("asn"),
        org_name: r.get("org_name"),
        country_code: r.get("country_code"),
        prefix: r.get("prefix"),
        source: r.get("source"),
        last_enriched: r.get("last_enriched"),
        last_enrichment_attempt: r.get("last_enrichment_attempt"),
    }))
}

/// Write-through upsert after a successful lookup round. `last_seen` is
/// monotonic; `avg_rtt_ms` is the running mean weighted by measurement
/// counts; per-field COALESCE keeps older values when the batch has none.
pub async fn upsert_asn(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    record: &AsnUpsert,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO {}.asns (
            asn, org_name, country_code, prefix, source,
            peeringdb_id, facility_count, peering_policy, traffic_levels, irr_as_set,
            prefix_count, neighbor_count,
            total_measurements, avg_rtt_ms,
            first_seen, last_seen, last_enriched, last_enrichment_attempt
        ) VALUES ($1, $2, $3, $4::cidr, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15, $16, $16)
        ON CONFLICT (asn) DO UPDATE SET
            org_name = COALESCE(EXCLUDED.org_name, {s}.asns.org_name),
            country_code = COALESCE(EXCLUDED.country_code, {s}.asns.country_code),
            prefix = COALESCE(EXCLUDED.prefix, {s}.asns.prefix),
            source = COALESCE(EXCLUDED.source, {s}.asns.source),
            peeringdb_id = COALESCE(EXCLUDED.peeringdb_id, {s}.asns.peeringdb_id),
            facility_count = COALESCE(EXCLUDED.facility_count, {s}.asns.facility_count),
            peering_policy = COALESCE(EXCLUDED.peering_policy, {s}.asns.peering_policy),
            traffic_levels = COALESCE(EXCLUDED.traffic_levels, {s}.asns.traffic_levels),
            irr_as_set = COALESCE(EXCLUDED.irr_as_set, {s}.asns.irr_as_set),
            prefix_count = COALESCE(EXCLUDED.prefix_count, {s}.asns.prefix_count),
            neighbor_count = COALESCE(EXCLUDED.neighbor_count, {s}.asns.neighbor_count),
            total_measurements = {s}.asns.total_measurements + EXCLUDED.total_measurements,
            avg_rtt_ms = CASE
                WHEN EXCLUDED.avg_rtt_ms IS NULL THEN {s}.asns.avg_rtt_ms
                WHEN {s}.asns.avg_rtt_ms IS NULL THEN EXCLUDED.avg_rtt_ms
                ELSE ({s}.asns.avg_rtt_ms * {s}.asns.total_measurements
                      + EXCLUDED.avg_rtt_ms * EXCLUDED.total_measurements)
                     / NULLIF({s}.asns.total_measurements + EXCLUDED.total_measurements, 0)
            END,
            last_seen = GREATEST({s}.asns.last_seen, EXCLUDED.last_seen),
            last_enriched = GREATEST(COALESCE({s}.asns.last_enriched, EXCLUDED.last_enriched), EXCLUDED.last_enriched),
            last_enrichment_attempt = GREATEST(COALESCE({s}.asns.last_enrichment_attempt, EXCLUDED.last_enrichment_attempt), EXCLUDED.last_enrichment_attempt)",
        SCHEMA,
        s = SCHEMA
    ))
    .bind(record.asn)
    .bind(record.org_name.as_deref())
    .bind(record.country_code.as_deref())
    .bind(record.prefix.as_deref())
    .bind(record.source.as_deref())
    .bind(record.peeringdb_id)
    .bind(record.facility_count)
    .bind(record.peering_policy.as_deref())
    .bind(record.traffic_levels.as_deref())
    .bind(record.irr_as_set.as_deref())
    .bind(record.prefix_count)
    .bind(record.neighbor_count)
    .bind(record.measurement_count)
    .bind(record.batch_avg_rtt_ms)
    .bind(now)
    .bind(record.freshly_enriched.then_some(now))
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// Stamp a failed lookup round so the negative-cache TTL can gate retries.
pub async fn touch_enrichment_attempt(pool: &DbPool, asn: i64, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE {}.asns SET last_enrichment_attempt = GREATEST(COALESCE(last_enrichment_attempt, $2), $2)
             WHERE asn = $1",
        SCHEMA
    ))
    .bind(asn)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Load a dotted settings group (`prefix.*`) as a suffix → JSON value map.
pub async fn load_settings_group(
    pool: &DbPool,
    prefix: &str,
) -> Result<HashMap<String, Value>> {
    let like = format!("{}.%", prefix);
    let rows = sqlx::query(&format!(
        "SELECT key, value FROM {}.settings WHERE key LIKE $1",
        SCHEMA
    ))
    .bind(&like)
    .fetch_all(pool)
    .await?;

    let mut group = HashMap::new();
    for row in rows {
        let key: String = row.get("key");
        let value: Value = row.get("value");
        if let Some(suffix) = key.strip_prefix(prefix).and_then(|k| k.strip_prefix('.')) {
            group.insert(suffix.to_string(), value);
        }
    }
    Ok(group)
}

pub async fn get_setting(pool: &DbPool, key: &str) -> Result<Option<Value>> {
    let row = sqlx::query(&format!(
        "SELECT value FROM {}.settings WHERE key = $1",
        SCHEMA
    ))
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("value")))
}

pub async fn set_setting(pool: &DbPool, key: &str, value: &Value) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO {}.settings (key, value, updated_at) VALUES ($1, $2, NOW())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        SCHEMA
    ))
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

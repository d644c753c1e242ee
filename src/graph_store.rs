// AS graph store - labeled nodes and directed edges with per-edge stats.
//
// Upserts are single statements so `observed_count` increments and the
// RTT bounds are atomic; concurrent projectors cannot lose observations.
// Postgres LEAST/GREATEST ignore NULLs, which is exactly the semantics we
// want when an edge observation carries no RTT sample.

use crate::database::{DbPool, SCHEMA};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row};

#[derive(Debug, Clone, PartialEq)]
pub struct AsEdge {
    pub src_asn: i64,
    pub dst_asn: i64,
    pub observed_count: i64,
    pub min_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("self-loop edge {0} -> {0} rejected")]
    SelfLoop(i64),
    #[error("graph store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub struct GraphStore {
    db: DbPool,
}

impl GraphStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Upsert an AS node, refreshing metadata and `last_seen`.
    pub async fn upsert_node(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        asn: i64,
        org_name: Option<&str>,
        country_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        sqlx::query(&format!(
            "INSERT INTO {s}.as_nodes (asn, org_name, country_code, first_seen, last_seen)
                 VALUES ($1, $2, $3, $4, $4)
                 ON CONFLICT (asn) DO UPDATE SET
                     org_name = COALESCE(EXCLUDED.org_name, {s}.as_nodes.org_name),
                     country_code = COALESCE(EXCLUDED.country_code, {s}.as_nodes.country_code),
                     last_seen = GREATEST({s}.as_nodes.last_seen, EXCLUDED.last_seen)",
            s = SCHEMA
        ))
        .bind(asn)
        .bind(org_name)
        .bind(country_code)
        .bind(now)
        .execute(tx.as_mut())
        .await
        .map_err(|e| GraphError::Store(e.into()))?;
        Ok(())
    }

    /// Upsert a directed edge and fold one observation into its stats.
    pub async fn upsert_edge(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        src_asn: i64,
        dst_asn: i64,
        rtt_sample_ms: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        if src_asn == dst_asn {
            return Err(GraphError::SelfLoop(src_asn));
        }
        sqlx::query(&format!(
            "INSERT INTO {s}.as_edges
                 (src_asn, dst_asn, observed_count, min_rtt_ms, max_rtt_ms, first_seen, last_seen)
                 VALUES ($1, $2, 1, $3, $3, $4, $4)
                 ON CONFLICT (src_asn, dst_asn) DO UPDATE SET
                     observed_count = {s}.as_edges.observed_count + 1,
                     min_rtt_ms = LEAST({s}.as_edges.min_rtt_ms, EXCLUDED.min_rtt_ms),
                     max_rtt_ms = GREATEST({s}.as_edges.max_rtt_ms, EXCLUDED.max_rtt_ms),
                     last_seen = GREATEST({s}.as_edges.last_seen, EXCLUDED.last_seen)",
            s = SCHEMA
        ))
        .bind(src_asn)
        .bind(dst_asn)
        .bind(rtt_sample_ms)
        .bind(now)
        .execute(tx.as_mut())
        .await
        .map_err(|e| GraphError::Store(e.into()))?;
        Ok(())
    }

    pub async fn edge(&self, src_asn: i64, dst_asn: i64) -> Result<Option<AsEdge>, GraphError> {
        let row = sqlx::query(&format!(
            "SELECT src_asn, dst_asn, observed_count, min_rtt_ms, max_rtt_ms, last_seen
                 FROM {}.as_edges WHERE src_asn = $1 AND dst_asn = $2",
            SCHEMA
        ))
        .bind(src_asn)
        .bind(dst_asn)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| GraphError::Store(e.into()))?;
        Ok(row.map(|r| AsEdge {
            src_asn: r.get("src_asn"),
            dst_asn: r.get("dst_asn"),
            observed_count: r.get("observed_count"),
            min_rtt_ms: r.get("min_rtt_ms"),
            max_rtt_ms: r.get("max_rtt_ms"),
            last_seen: r.get("last_seen"),
        }))
    }

    pub async fn node_count(&self) -> Result<i64, GraphError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) as count FROM {}.as_nodes", SCHEMA))
            .fetch_one(&self.db)
            .await
            .map_err(|e| GraphError::Store(anyhow::Error::from(e)))?;
        row.try_get("count")
            .map_err(|e| GraphError::Store(anyhow::Error::from(e)))
    }

    pub async fn edge_count(&self) -> Result<i64, GraphError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) as count FROM {}.as_edges", SCHEMA))
            .fetch_one(&self.db)
            .await
            .map_err(|e| GraphError::Store(anyhow::Error::from(e)))?;
        row.try_get("count")
            .map_err(|e| GraphError::Store(anyhow::Error::from(e)))
    }
}

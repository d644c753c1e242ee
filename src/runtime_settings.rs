// Runtime settings - live pipeline configuration backed by the settings table.
//
// Every pipeline loop re-reads its settings group at the top of each cycle,
// so operators can retune a running node by updating rows; no hot-reload
// plumbing is needed. Invalid values fall back to the documented default
// with a warning, never abort a cycle.

use crate::database::{self, DbPool};
use anyhow::Result;
use arc_swap::ArcSwap;
use log::warn;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Probe cap per worker over any rolling 60-second window.
    pub rate_limit_per_minute: u32,
    /// In-flight probe cap per worker.
    pub max_concurrent_probes: usize,
    /// Pool size; applied by the external process manager, reported here so
    /// operators can read the intended size back.
    pub worker_count: usize,
    pub probe_timeout_seconds: u64,
    /// Ordered tool list; the first tool present on the host wins.
    pub tool_preference: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 30,
            max_concurrent_probes: 5,
            worker_count: 2,
            probe_timeout_seconds: 30,
            tool_preference: vec![
                "scamper".to_string(),
                "traceroute".to_string(),
                "mtr".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentSettings {
    /// Measurements picked up per enrichment cycle.
    pub batch_size: i64,
    /// Positive cache TTL on asns rows.
    pub asn_cache_ttl_seconds: u64,
    /// Negative cache TTL for failed lookups.
    pub negative_cache_ttl_seconds: u64,
    /// After this many attempts a measurement is marked enriched with
    /// whatever partial data exists.
    pub max_attempts: i32,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            asn_cache_ttl_seconds: 7 * 24 * 3600,
            negative_cache_ttl_seconds: 3600,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemeasurementSettings {
    /// Targets whose last probe is older than this are refreshed.
    pub ttl_seconds: u64,
    /// Targets re-enqueued per scheduler cycle.
    pub batch_limit: i64,
    pub interval_seconds: u64,
}

impl Default for RemeasurementSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 86400,
            batch_limit: 200,
            interval_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeSettings {
    pub worker: WorkerSettings,
    pub enrichment: EnrichmentSettings,
    pub remeasurement: RemeasurementSettings,
}

/// Parse one settings value, falling back to `default` when the key is
/// missing or the stored JSON does not deserialize into the expected shape.
fn field_or_default<T: DeserializeOwned>(
    group: &HashMap<String, Value>,
    key: &str,
    default: T,
) -> T {
    match group.get(key) {
        None => default,
        Some(value) => match serde_json::from_value::<T>(value.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    "⚠️ Invalid settings value for '{}' ({}), using default",
                    key, e
                );
                default
            }
        },
    }
}

impl WorkerSettings {
    pub fn from_group(group: &HashMap<String, Value>) -> Self {
        let d = Self::default();
        Self {
            rate_limit_per_minute: field_or_default(
                group,
                "rate_limit_per_minute",
                d.rate_limit_per_minute,
            ),
            max_concurrent_probes: field_or_default(
                group,
                "max_concurrent_probes",
                d.max_concurrent_probes,
            ),
            worker_count: field_or_default(group, "worker_count", d.worker_count),
            probe_timeout_seconds: field_or_default(
                group,
                "probe_timeout_seconds",
                d.probe_timeout_seconds,
            ),
            tool_preference: field_or_default(group, "tool_preference", d.tool_preference),
        }
    }
}

impl EnrichmentSettings {
    pub fn from_group(group: &HashMap<String, Value>) -> Self {
        let d = Self::default();
        Self {
            batch_size: field_or_default(group, "batch_size", d.batch_size),
            asn_cache_ttl_seconds: field_or_default(
                group,
                "asn_cache_ttl_seconds",
                d.asn_cache_ttl_seconds,
            ),
            negative_cache_ttl_seconds: field_or_default(
                group,
                "negative_cache_ttl_seconds",
                d.negative_cache_ttl_seconds,
            ),
            max_attempts: field_or_default(group, "max_attempts", d.max_attempts),
        }
    }
}

impl RemeasurementSettings {
    pub fn from_group(group: &HashMap<String, Value>) -> Self {
        let d = Self::default();
        Self {
            ttl_seconds: field_or_default(group, "ttl_seconds", d.ttl_seconds),
            batch_limit: field_or_default(group, "batch_limit", d.batch_limit),
            interval_seconds: field_or_default(group, "interval_seconds", d.interval_seconds),
        }
    }
}

impl RuntimeSettings {
    /// Load all settings groups from the store. Keys are dotted, e.g.
    /// `worker_settings.rate_limit_per_minute`; a missing key means default.
    pub async fn load(db: &DbPool) -> Result<Self> {
        let worker = database::load_settings_group(db, "worker_settings").await?;
        let enrichment = database::load_settings_group(db, "enrichment_settings").await?;
        let remeasurement = database::load_settings_group(db, "remeasurement_settings").await?;
        Ok(Self {
            worker: WorkerSettings::from_group(&worker),
            enrichment: EnrichmentSettings::from_group(&enrichment),
            remeasurement: RemeasurementSettings::from_group(&remeasurement),
        })
    }

    /// Load, degrading to defaults (with a warning) if the store round-trip
    /// fails. Background loops must never die on a settings read.
    pub async fn load_or_default(db: &DbPool) -> Self {
        match Self::load(db).await {
            Ok(s) => s,
            Err(e) => {
                warn!("⚠️ Failed to load runtime settings ({}), using defaults", e);
                Self::default()
            }
        }
    }
}

/// Lock-free snapshot of the current runtime settings, refreshed by each
/// loop at cycle boundaries and readable from any task without blocking.
pub struct SharedRuntimeSettings {
    inner: ArcSwap<RuntimeSettings>,
}

impl SharedRuntimeSettings {
    pub fn new(initial: RuntimeSettings) -> Self {
        Self {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    pub fn snapshot(&self) -> Arc<RuntimeSettings> {
        self.inner.load_full()
    }

    pub async fn refresh(&self, db: &DbPool) -> Arc<RuntimeSettings> {
        let fresh = RuntimeSettings::load_or_default(db).await;
        self.inner.store(Arc::new(fresh));
        self.snapshot()
    }
}

impl Default for SharedRuntimeSettings {
    fn default() -> Self {
        Self::new(RuntimeSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_settings_defaults() {
        let settings = WorkerSettings::from_group(&HashMap::new());
        assert_eq!(settings.rate_limit_per_minute, 30);
        assert_eq!(settings.max_concurrent_probes, 5);
        assert_eq!(settings.worker_count, 2);
        assert_eq!(settings.probe_timeout_seconds, 30);
        assert_eq!(
            settings.tool_preference,
            vec!["scamper", "traceroute", "mtr"]
        );
    }

    #[test]
    fn test_worker_settings_overrides() {
        let mut group = HashMap::new();
        group.insert("rate_limit_per_minute".to_string(), json!(10));
        group.insert("tool_preference".to_string(), json!(["mtr", "traceroute"]));
        let settings = WorkerSettings::from_group(&group);
        assert_eq!(settings.rate_limit_per_minute, 10);
        assert_eq!(settings.tool_preference, vec!["mtr", "traceroute"]);
        // Untouched fields keep defaults
        assert_eq!(settings.max_concurrent_probes, 5);
    }

    #[test]
    fn test_invalid_value_falls_back() {
        let mut group = HashMap::new();
        group.insert("batch_size".to_string(), json!("not-a-number"));
        group.insert("max_attempts".to_string(), json!(7));
        let settings = EnrichmentSettings::from_group(&group);
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.max_attempts, 7);
    }

    #[test]
    fn test_remeasurement_defaults() {
        let settings = RemeasurementSettings::from_group(&HashMap::new());
        assert_eq!(settings.ttl_seconds, 86400);
        assert_eq!(settings.batch_limit, 200);
        assert_eq!(settings.interval_seconds, 3600);
    }
}

// Enrichment engine - annotates hop IPs with AS metadata from the
// multi-source merge procedure and maintains the asns write-through cache.
//
// Source order per IP: local cache (TTL-gated, longest prefix), Team Cymru,
// then PeeringDB once the ASN is known, then the external fallbacks
// (RIPEstat, ip-api, ipinfo). When several sources supply the same field,
// priority is PeeringDB > fallbacks > Cymru. The asns.source column records
// who supplied the core fields.

use crate::database::{self, AsnUpsert, DbPool, HopRow, MeasurementBatchItem};
use crate::enrichment_sources::{
    CymruWhois, EnrichmentSource, IpApi, IpInfo, PeeringDbClient, PeeringDbRecord, RipeStat,
    SourceError,
};
use crate::metrics;
use crate::runtime_settings::{RuntimeSettings, SharedRuntimeSettings};
use crate::settings::Settings;
use crate::types::{is_enrichable_ip, AsLookup};
use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use lru::LruCache;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Instant};

/// How long a successful lookup stays in the in-process memo. The durable
/// positive cache is the asns table; the memo only absorbs repeats across
/// adjacent cycles.
const POSITIVE_MEMO_TTL: Duration = Duration::from_secs(300);

/// Concurrent in-flight lookups per cycle. External sources see at most
/// this many parallel requests from one node.
const LOOKUP_CONCURRENCY: usize = 8;

/// Result of the merge procedure for one IP.
#[derive(Debug, Clone)]
pub struct ResolvedIp {
    pub lookup: AsLookup,
    /// Source of the core fields ("cymru", "ripe", "ip-api", "ipinfo" or
    /// "cache").
    pub source: String,
    pub peeringdb: Option<PeeringDbRecord>,
    pub routing: Option<(Option<i32>, Option<i32>)>,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
enum MemoEntry {
    Hit(ResolvedIp),
    Miss,
}

pub struct EnrichmentEngine {
    db: DbPool,
    settings: Arc<Settings>,
    runtime: Arc<SharedRuntimeSettings>,
    cymru: CymruWhois,
    peeringdb: PeeringDbClient,
    ripe: Arc<RipeStat>,
    fallbacks: Vec<Arc<dyn EnrichmentSource>>,
    memo: Mutex<LruCache<IpAddr, (Instant, MemoEntry)>>,
}

impl EnrichmentEngine {
    pub fn new(
        db: DbPool,
        settings: Arc<Settings>,
        runtime: Arc<SharedRuntimeSettings>,
    ) -> Result<Self> {
        let e = &settings.enrichment;
        let timeout = Duration::from_secs(e.source_timeout_seconds);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tracemap-node/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let ripe = Arc::new(RipeStat::new(
            client.clone(),
            e.ripestat_base_url.clone(),
            timeout,
        ));
        let fallbacks: Vec<Arc<dyn EnrichmentSource>> = vec![
            ripe.clone(),
            Arc::new(IpApi::new(
                client.clone(),
                e.ip_api_base_url.clone(),
                timeout,
                e.ip_api_rate_per_minute,
            )),
            Arc::new(IpInfo::new(
                client.clone(),
                e.ipinfo_base_url.clone(),
                timeout,
                e.ipinfo_token.clone(),
            )),
        ];

        let memo_capacity =
            NonZeroUsize::new(e.lookup_memo_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            cymru: CymruWhois::new(e.cymru_whois_host.clone(), timeout),
            peeringdb: PeeringDbClient::new(client, e.peeringdb_base_url.clone(), timeout),
            ripe,
            fallbacks,
            memo: Mutex::new(LruCache::new(memo_capacity)),
            db,
            settings,
            runtime,
        })
    }

    /// Run until shutdown. Each cycle re-reads the settings store, picks up
    /// a batch of un-enriched measurements, and processes it in one
    /// transaction.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let cycle_sleep = Duration::from_secs(self.settings.enrichment.cycle_sleep_seconds);
        info!("🚀 Enrichment engine started (cycle sleep {:?})", cycle_sleep);

        while !*shutdown.borrow() {
            let rs = self.runtime.refresh(&self.db).await;
            match self.run_cycle(&rs).await {
                Ok(0) => {}
                Ok(processed) => {
                    info!("✅ Enrichment cycle completed: {} measurements", processed);
                    // Backlog present: go straight into the next cycle
                    continue;
                }
                Err(e) => {
                    error!("❌ Enrichment cycle failed: {}", e);
                }
            }
            tokio::select! {
                _ = sleep(cycle_sleep) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("✅ Enrichment engine stopped");
    }

    /// One enrichment pass. Returns the number of measurements marked
    /// enriched.
    pub async fn run_cycle(&self, rs: &RuntimeSettings) -> Result<usize> {
        // The batch selects retry through transient store hiccups; a
        // persistent failure drops the cycle and the next one picks it up.
        let retry = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        let batch = Retry::spawn(retry.clone(), || {
            database::fetch_unenriched(&self.db, rs.enrichment.batch_size)
        })
        .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        let hops = Retry::spawn(retry, || {
            database::fetch_hops_for_measurements(&self.db, &ids)
        })
        .await?;

        let public_ips = collect_public_ips(&hops);
        debug!(
            "Enriching {} measurements, {} distinct public hop IPs",
            batch.len(),
            public_ips.len()
        );

        let mut resolutions: HashMap<IpAddr, Option<ResolvedIp>> = HashMap::new();
        for chunk in public_ips.chunks(LOOKUP_CONCURRENCY) {
            let outcomes = join_all(chunk.iter().map(|ip| self.lookup_ip(*ip, rs))).await;
            for (ip, outcome) in chunk.iter().zip(outcomes) {
                match &outcome {
                    Some(resolved) => metrics::increment_lookup(&resolved.source),
                    None => metrics::increment_lookup("failed"),
                }
                resolutions.insert(*ip, outcome);
            }
        }

        let measurement_ips = ips_by_measurement(&hops);
        let (ready, deferred) = partition_ready(
            &batch,
            &measurement_ips,
            &resolutions,
            rs.enrichment.max_attempts,
        );
        let asn_upserts = aggregate_asns(&hops, &resolutions);

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        for (ip, outcome) in &resolutions {
            let Some(resolved) = outcome else { continue };
            let org = resolved
                .peeringdb
                .as_ref()
                .and_then(|p| p.org_name.clone())
                .or_else(|| resolved.lookup.org_name.clone());
            database::update_hops_enrichment(
                &mut tx,
                &ids,
                &ip.to_string(),
                resolved.lookup.asn,
                resolved.lookup.prefix.as_deref(),
                org.as_deref(),
                resolved.lookup.country_code.as_deref(),
            )
            .await?;
        }
        for record in &asn_upserts {
            database::upsert_asn(&mut tx, record, now).await?;
        }
        database::mark_enriched(&mut tx, &ready, now).await?;
        database::increment_enrichment_attempts(&mut tx, &deferred).await?;
        tx.commit().await?;

        if !deferred.is_empty() {
            warn!(
                "⚠️ Deferred {} measurements with unresolved hop IPs",
                deferred.len()
            );
        }
        metrics::record_measurements_enriched(ready.len() as u64);
        Ok(ready.len())
    }

    /// The merge procedure for a single IP. `None` means every source
    /// failed; the negative memo keeps the next cycles from hammering the
    /// same failing sources.
    async fn lookup_ip(&self, ip: IpAddr, rs: &RuntimeSettings) -> Option<ResolvedIp> {
        let negative_ttl = Duration::from_secs(rs.enrichment.negative_cache_ttl_seconds);
        {
            let mut memo = self.memo.lock().await;
            if let Some((at, entry)) = memo.get(&ip) {
                let ttl = match entry {
                    MemoEntry::Hit(_) => POSITIVE_MEMO_TTL,
                    MemoEntry::Miss => negative_ttl,
                };
                if at.elapsed() < ttl {
                    return match entry {
                        MemoEntry::Hit(resolved) => Some(resolved.clone()),
                        MemoEntry::Miss => None,
                    };
                }
            }
        }

        let outcome = self.lookup_ip_uncached(ip, rs).await;
        let entry = match &outcome {
            Some(resolved) => MemoEntry::Hit(resolved.clone()),
            None => MemoEntry::Miss,
        };
        self.memo.lock().await.put(ip, (Instant::now(), entry));
        outcome
    }

    async fn lookup_ip_uncached(&self, ip: IpAddr, rs: &RuntimeSettings) -> Option<ResolvedIp> {
        // Source 1: the asns table, longest matching prefix inside the TTL.
        let cache_ttl = Duration::from_secs(rs.enrichment.asn_cache_ttl_seconds);
        match database::cached_asn_for_ip(&self.db, &ip, cache_ttl).await {
            Ok(Some(cached)) => {
                metrics::increment_cache_event("hit");
                return Some(ResolvedIp {
                    lookup: AsLookup {
                        asn: Some(cached.asn),
                        org_name: cached.org_name,
                        country_code: cached.country_code,
                        prefix: cached.prefix,
                    },
                    source: "cache".to_string(),
                    peeringdb: None,
                    routing: None,
                    from_cache: true,
                });
            }
            Ok(None) => {
                metrics::increment_cache_event("miss");
            }
            Err(e) => {
                warn!("⚠️ ASN cache lookup failed for {}: {}", ip, e);
            }
        }

        // Source 2: Team Cymru.
        let cymru_result = match self.cymru.lookup_ip(ip).await {
            Ok(lookup) => Some(lookup),
            Err(e) => {
                debug!("Cymru lookup failed for {}: {}", ip, e);
                None
            }
        };

        // Source 4 (fallbacks) only run when Cymru produced no ASN.
        let mut fallback_result: Option<(String, AsLookup)> = None;
        if cymru_result.as_ref().and_then(|c| c.asn).is_none() {
            for source in &self.fallbacks {
                match source.lookup_ip(ip).await {
                    Ok(lookup) if lookup.asn.is_some() => {
                        fallback_result = Some((source.name().to_string(), lookup));
                        break;
                    }
                    Ok(_) => continue,
                    Err(SourceError::RateLimited) => {
                        debug!("{} rate-limited, trying next source", source.name());
                    }
                    Err(e) => {
                        debug!("{} lookup failed for {}: {}", source.name(), ip, e);
                    }
                }
            }
        }

        let core_source = if cymru_result.as_ref().and_then(|c| c.asn).is_some() {
            "cymru".to_string()
        } else if let Some((name, _)) = &fallback_result {
            name.clone()
        } else {
            // Every source failed for this IP
            return None;
        };

        let merged = merge_with_priority(
            fallback_result.as_ref().map(|(_, l)| l),
            cymru_result.as_ref(),
        );
        let asn = merged.asn?;

        // Source 3: PeeringDB, now that the ASN is known. Best effort; its
        // org name overrides the core one at write time.
        let peeringdb = match self.peeringdb.lookup_asn(asn).await {
            Ok(record) => Some(record),
            Err(SourceError::NoData) => None,
            Err(e) => {
                debug!("PeeringDB lookup failed for AS{}: {}", asn, e);
                // Partial detail failure: stamp the attempt so the negative
                // TTL gates re-tries against a flapping PeeringDB.
                database::touch_enrichment_attempt(&self.db, asn, Utc::now())
                    .await
                    .ok();
                None
            }
        };

        let routing = match self.ripe.routing_status(asn).await {
            Ok(counts) => Some(counts),
            Err(e) => {
                debug!("RIPEstat routing-status failed for AS{}: {}", asn, e);
                None
            }
        };

        Some(ResolvedIp {
            lookup: merged,
            source: core_source,
            peeringdb,
            routing,
            from_cache: false,
        })
    }
}

/// Merge fallback and Cymru records under the fixed field priority
/// (fallbacks > Cymru). The PeeringDB org override happens at write time so
/// the core `source` attribution stays honest.
pub(crate) fn merge_with_priority(
    fallback: Option<&AsLookup>,
    cymru: Option<&AsLookup>,
) -> AsLookup {
    let mut merged = fallback.cloned().unwrap_or_default();
    if let Some(cymru) = cymru {
        merged.fill_missing_from(cymru);
    }
    merged
}

/// Distinct public hop IPs across the batch, in deterministic order.
pub(crate) fn collect_public_ips(hops: &[HopRow]) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for hop in hops {
        let Some(ip) = hop.hop_ip.as_deref().and_then(|t| t.parse::<IpAddr>().ok()) else {
            continue;
        };
        if is_enrichable_ip(&ip) && seen.insert(ip) {
            out.push(ip);
        }
    }
    out
}

/// Public IPs grouped by measurement, used to decide per-measurement
/// completeness.
pub(crate) fn ips_by_measurement(hops: &[HopRow]) -> HashMap<i64, HashSet<IpAddr>> {
    let mut map: HashMap<i64, HashSet<IpAddr>> = HashMap::new();
    for hop in hops {
        let entry = map.entry(hop.measurement_id).or_default();
        if let Some(ip) = hop.hop_ip.as_deref().and_then(|t| t.parse::<IpAddr>().ok()) {
            if is_enrichable_ip(&ip) {
                entry.insert(ip);
            }
        }
    }
    map
}

/// Split the batch into measurements that can flip `enriched` now and
/// measurements to defer. A measurement is ready when every one of its
/// public hop IPs resolved, or when the retry ceiling is reached (partial
/// data is better than an eternally pending row).
pub(crate) fn partition_ready(
    batch: &[MeasurementBatchItem],
    measurement_ips: &HashMap<i64, HashSet<IpAddr>>,
    resolutions: &HashMap<IpAddr, Option<ResolvedIp>>,
    max_attempts: i32,
) -> (Vec<i64>, Vec<i64>) {
    let mut ready = Vec::new();
    let mut deferred = Vec::new();
    for m in batch {
        let fully_resolved = measurement_ips
            .get(&m.id)
            .map(|ips| {
                ips.iter()
                    .all(|ip| matches!(resolutions.get(ip), Some(Some(_))))
            })
            // No public hop IPs at all (failed probe, all-private path):
            // nothing to enrich, flip the flag.
            .unwrap_or(true);
        if fully_resolved || m.enrichment_attempts + 1 >= max_attempts {
            ready.push(m.id);
        } else {
            deferred.push(m.id);
        }
    }
    (ready, deferred)
}

/// Fold the batch's resolved hops into one upsert per distinct ASN:
/// measurement count, batch mean RTT, merged metadata.
pub(crate) fn aggregate_asns(
    hops: &[HopRow],
    resolutions: &HashMap<IpAddr, Option<ResolvedIp>>,
) -> Vec<AsnUpsert> {
    struct Agg {
        record: AsnUpsert,
        measurements: HashSet<i64>,
        rtt_sum: f64,
        rtt_count: u32,
    }
    let mut by_asn: HashMap<i64, Agg> = HashMap::new();

    for hop in hops {
        let Some(ip) = hop.hop_ip.as_deref().and_then(|t| t.parse::<IpAddr>().ok()) else {
            continue;
        };
        let Some(Some(resolved)) = resolutions.get(&ip) else {
            continue;
        };
        let Some(asn) = resolved.lookup.asn else {
            continue;
        };

        let agg = by_asn.entry(asn).or_insert_with(|| {
            let mut record = AsnUpsert {
                asn,
                org_name: resolved.lookup.org_name.clone(),
                country_code: resolved.lookup.country_code.clone(),
                prefix: resolved.lookup.prefix.clone(),
                source: (!resolved.from_cache).then(|| resolved.source.clone()),
                freshly_enriched: !resolved.from_cache,
                ..AsnUpsert::default()
            };
            if let Some(peeringdb) = &resolved.peeringdb {
                // PeeringDB always wins the org field when present
                if peeringdb.org_name.is_some() {
                    record.org_name = peeringdb.org_name.clone();
                }
                record.peeringdb_id = peeringdb.fields.peeringdb_id;
                record.facility_count = peeringdb.fields.facility_count;
                record.peering_policy = peeringdb.fields.peering_policy.clone();
                record.traffic_levels = peeringdb.fields.traffic_levels.clone();
                record.irr_as_set = peeringdb.fields.irr_as_set.clone();
            }
            if let Some((prefix_count, neighbor_count)) = resolved.routing {
                record.prefix_count = prefix_count;
                record.neighbor_count = neighbor_count;
            }
            Agg {
                record,
                measurements: HashSet::new(),
                rtt_sum: 0.0,
                rtt_count: 0,
            }
        });

        agg.measurements.insert(hop.measurement_id);
        if let Some(rtt) = hop.rtt_ms {
            agg.rtt_sum += rtt;
            agg.rtt_count += 1;
        }
    }

    by_asn
        .into_values()
        .map(|mut agg| {
            agg.record.measurement_count = agg.measurements.len() as i64;
            agg.record.batch_avg_rtt_ms = if agg.rtt_count > 0 {
                Some(agg.rtt_sum / agg.rtt_count as f64)
            } else {
                None
            };
            agg.record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(m: i64, n: i32, ip: Option<&str>, rtt: Option<f64>) -> HopRow {
        HopRow {
            measurement_id: m,
            hop_number: n,
            hop_ip: ip.map(|s| s.to_string()),
            rtt_ms: rtt,
            asn: None,
        }
    }

    fn resolved(asn: i64, org: &str) -> ResolvedIp {
        ResolvedIp {
            lookup: AsLookup {
                asn: Some(asn),
                org_name: Some(org.to_string()),
                country_code: Some("US".to_string()),
                prefix: None,
            },
            source: "cymru".to_string(),
            peeringdb: None,
            routing: None,
            from_cache: false,
        }
    }

    fn item(id: i64, attempts: i32) -> MeasurementBatchItem {
        MeasurementBatchItem {
            id,
            completed_at: Some(Utc::now()),
            enrichment_attempts: attempts,
        }
    }

    #[test]
    fn test_merge_priority_fallback_over_cymru() {
        let fallback = AsLookup {
            asn: Some(15169),
            org_name: Some("Google LLC".to_string()),
            country_code: None,
            prefix: None,
        };
        let cymru = AsLookup {
            asn: Some(15169),
            org_name: Some("GOOGLE, US".to_string()),
            country_code: Some("US".to_string()),
            prefix: Some("8.8.8.0/24".to_string()),
        };
        let merged = merge_with_priority(Some(&fallback), Some(&cymru));
        assert_eq!(merged.org_name.as_deref(), Some("Google LLC"));
        assert_eq!(merged.country_code.as_deref(), Some("US"));
        assert_eq!(merged.prefix.as_deref(), Some("8.8.8.0/24"));
    }

    #[test]
    fn test_merge_cymru_only() {
        let cymru = AsLookup {
            asn: Some(13335),
            org_name: Some("CLOUDFLARENET, US".to_string()),
            country_code: Some("US".to_string()),
            prefix: Some("1.1.1.0/24".to_string()),
        };
        let merged = merge_with_priority(None, Some(&cymru));
        assert_eq!(merged, cymru);
    }

    #[test]
    fn test_collect_public_ips_skips_private_and_timeouts() {
        let hops = vec![
            hop(1, 1, Some("192.168.1.1"), Some(0.5)),
            hop(1, 2, None, None),
            hop(1, 3, Some("1.1.1.1"), Some(10.0)),
            hop(2, 1, Some("1.1.1.1"), Some(11.0)),
            hop(2, 2, Some("8.8.8.8"), Some(12.0)),
        ];
        let ips = collect_public_ips(&hops);
        assert_eq!(
            ips,
            vec![
                "1.1.1.1".parse::<IpAddr>().unwrap(),
                "8.8.8.8".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_partition_ready() {
        let batch = vec![item(1, 0), item(2, 0), item(3, 2), item(4, 0)];
        let ip_a: IpAddr = "1.1.1.1".parse().unwrap();
        let ip_b: IpAddr = "9.9.9.9".parse().unwrap();

        let mut measurement_ips: HashMap<i64, HashSet<IpAddr>> = HashMap::new();
        measurement_ips.insert(1, [ip_a].into_iter().collect());
        measurement_ips.insert(2, [ip_a, ip_b].into_iter().collect());
        measurement_ips.insert(3, [ip_b].into_iter().collect());
        // Measurement 4: no public hop IPs (zero-hop probe)

        let mut resolutions: HashMap<IpAddr, Option<ResolvedIp>> = HashMap::new();
        resolutions.insert(ip_a, Some(resolved(13335, "CLOUDFLARENET")));
        resolutions.insert(ip_b, None);

        let (ready, deferred) = partition_ready(&batch, &measurement_ips, &resolutions, 3);
        // 1 fully resolved; 3 hit the retry ceiling (2 + 1 >= 3); 4 trivially
        assert_eq!(ready, vec![1, 3, 4]);
        // 2 has an unresolved IP and attempts to spare
        assert_eq!(deferred, vec![2]);
    }

    #[test]
    fn test_aggregate_asns_counts_measurements_once() {
        let ip_a: IpAddr = "1.1.1.1".parse().unwrap();
        let hops = vec![
            // Same measurement traverses AS13335 twice
            hop(1, 3, Some("1.1.1.1"), Some(10.0)),
            hop(1, 4, Some("1.1.1.1"), Some(12.0)),
            hop(2, 5, Some("1.1.1.1"), None),
        ];
        let mut resolutions: HashMap<IpAddr, Option<ResolvedIp>> = HashMap::new();
        resolutions.insert(ip_a, Some(resolved(13335, "CLOUDFLARENET")));

        let upserts = aggregate_asns(&hops, &resolutions);
        assert_eq!(upserts.len(), 1);
        let record = &upserts[0];
        assert_eq!(record.asn, 13335);
        assert_eq!(record.measurement_count, 2, "two distinct measurements");
        let avg = record.batch_avg_rtt_ms.unwrap();
        assert!((avg - 11.0).abs() < 1e-9, "mean of the sampled RTTs");
        assert_eq!(record.source.as_deref(), Some("cymru"));
    }

    #[test]
    fn test_aggregate_asns_peeringdb_org_override() {
        let ip: IpAddr = "8.8.8.8".parse().unwrap();
        let mut r = resolved(15169, "GOOGLE, US");
        r.peeringdb = Some(PeeringDbRecord {
            org_name: Some("Google LLC".to_string()),
            fields: crate::types::PeeringDbFields {
                peeringdb_id: Some(433),
                ..Default::default()
            },
        });
        let hops = vec![hop(1, 8, Some("8.8.8.8"), Some(20.0))];
        let mut resolutions: HashMap<IpAddr, Option<ResolvedIp>> = HashMap::new();
        resolutions.insert(ip, Some(r));

        let upserts = aggregate_asns(&hops, &resolutions);
        assert_eq!(upserts[0].org_name.as_deref(), Some("Google LLC"));
        assert_eq!(upserts[0].source.as_deref(), Some("cymru"));
        assert_eq!(upserts[0].peeringdb_id, Some(433));
    }

    #[test]
    fn test_aggregate_asns_cache_hits_do_not_overwrite_source() {
        let ip: IpAddr = "1.1.1.1".parse().unwrap();
        let mut r = resolved(13335, "CLOUDFLARENET");
        r.from_cache = true;
        r.source = "cache".to_string();
        let hops = vec![hop(1, 2, Some("1.1.1.1"), Some(5.0))];
        let mut resolutions: HashMap<IpAddr, Option<ResolvedIp>> = HashMap::new();
        resolutions.insert(ip, Some(r));

        let upserts = aggregate_asns(&hops, &resolutions);
        // COALESCE(NULL, existing) in the upsert keeps the recorded source
        assert_eq!(upserts[0].source, None);
        assert!(!upserts[0].freshly_enriched, "cache hit must not bump last_enriched");
        assert_eq!(upserts[0].measurement_count, 1);
    }
}

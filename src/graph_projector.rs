// Graph projector - turns enriched measurements into AS adjacencies.
//
// The hop sequence is collapsed to its ASN spans: runs of the same ASN
// merge, null-ASN hops drop out. Consecutive distinct spans become directed
// edges. A gap of unresolved hops between two resolved ASNs still produces
// an adjacency (an observed transition over an opaque span); duplicates
// within one measurement are collapsed before counting so observed_count
// moves once per measurement.

use crate::database::{self, DbPool, HopRow};
use crate::graph_store::GraphStore;
use crate::metrics;
use crate::settings::Settings;
use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

/// One maximal run of hops sharing an ASN. `first_rtt_ms` is the RTT of the
/// first hop of the run, the sample used for edge statistics on entry into
/// the AS.
#[derive(Debug, Clone, PartialEq)]
pub struct AsnSpan {
    pub asn: i64,
    pub first_rtt_ms: Option<f64>,
}

pub struct GraphProjector {
    db: DbPool,
    graph: GraphStore,
    settings: Arc<Settings>,
}

impl GraphProjector {
    pub fn new(db: DbPool, settings: Arc<Settings>) -> Self {
        Self {
            graph: GraphStore::new(db.clone()),
            db,
            settings,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let cycle_sleep = Duration::from_secs(self.settings.graph.cycle_sleep_seconds);
        info!("🚀 Graph projector started (cycle sleep {:?})", cycle_sleep);

        while !*shutdown.borrow() {
            match self.run_cycle().await {
                Ok(0) => {}
                Ok(projected) => {
                    info!("✅ Projected {} measurements into the AS graph", projected);
                    continue;
                }
                Err(e) => {
                    error!("❌ Graph projection cycle failed: {}", e);
                }
            }
            tokio::select! {
                _ = sleep(cycle_sleep) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("✅ Graph projector stopped");
    }

    /// Project one batch of enriched-but-unprojected measurements. Returns
    /// how many were consumed.
    pub async fn run_cycle(&self) -> Result<usize> {
        let batch =
            database::fetch_enriched_unprojected(&self.db, self.settings.graph.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        let hops = database::fetch_hops_for_measurements(&self.db, &ids).await?;

        let mut hops_by_measurement: HashMap<i64, Vec<HopRow>> = HashMap::new();
        for hop in hops {
            hops_by_measurement
                .entry(hop.measurement_id)
                .or_default()
                .push(hop);
        }

        // Node metadata comes from the asns cache; memoized per cycle.
        let mut node_meta: HashMap<i64, (Option<String>, Option<String>)> = HashMap::new();

        let mut projected = 0usize;
        for id in &ids {
            let hops = hops_by_measurement.remove(id).unwrap_or_default();
            let sequence = collapse_asn_sequence(&hops);
            let edges = edges_of(&sequence);
            debug!(
                measurement = *id,
                spans = sequence.len(),
                edges = edges.len(),
                "projecting measurement"
            );

            for (src, dst, _) in &edges {
                for asn in [src, dst] {
                    if !node_meta.contains_key(asn) {
                        let meta = match database::get_asn(&self.db, *asn).await {
                            Ok(Some(cached)) => (cached.org_name, cached.country_code),
                            Ok(None) => (None, None),
                            Err(e) => {
                                warn!("⚠️ asns cache read failed for AS{}: {}", asn, e);
                                (None, None)
                            }
                        };
                        node_meta.insert(*asn, meta);
                    }
                }
            }

            let now = Utc::now();
            let mut tx = self.db.begin().await?;
            for (src, dst, rtt) in &edges {
                for asn in [src, dst] {
                    let (org, country) = node_meta.get(asn).cloned().unwrap_or((None, None));
                    self.graph
                        .upsert_node(&mut tx, *asn, org.as_deref(), country.as_deref(), now)
                        .await?;
                }
                self.graph
                    .upsert_edge(&mut tx, *src, *dst, *rtt, now)
                    .await?;
            }
            database::mark_graph_built(&mut tx, *id, now).await?;
            tx.commit().await?;

            metrics::record_edges_upserted(edges.len() as u64);
            projected += 1;
        }
        Ok(projected)
    }
}

/// Collapse a measurement's hops (ordered by hop number) into ASN spans:
/// null-ASN hops are dropped, runs of the same ASN merge. `[A,A,null,B,B,C]`
/// becomes `[A,B,C]`.
pub fn collapse_asn_sequence(hops: &[HopRow]) -> Vec<AsnSpan> {
    let mut ordered: Vec<&HopRow> = hops.iter().collect();
    ordered.sort_by_key(|h| h.hop_number);

    let mut spans: Vec<AsnSpan> = Vec::new();
    for hop in ordered {
        let Some(asn) = hop.asn else { continue };
        match spans.last() {
            Some(last) if last.asn == asn => {}
            _ => spans.push(AsnSpan {
                asn,
                first_rtt_ms: hop.rtt_ms,
            }),
        }
    }
    spans
}

/// Consecutive-pair edges of a collapsed sequence, deduplicated within the
/// measurement (flapping paths must not inflate observed_count). The RTT
/// sample of an edge is the first-hop RTT of the destination span.
pub fn edges_of(sequence: &[AsnSpan]) -> Vec<(i64, i64, Option<f64>)> {
    let mut seen: HashSet<(i64, i64)> = HashSet::new();
    let mut edges = Vec::new();
    for pair in sequence.windows(2) {
        let (src, dst) = (&pair[0], &pair[1]);
        if src.asn == dst.asn {
            continue; // collapse guarantees this, but stay defensive on input
        }
        if seen.insert((src.asn, dst.asn)) {
            edges.push((src.asn, dst.asn, dst.first_rtt_ms));
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn hop(n: i32, asn: Option<i64>, rtt: Option<f64>) -> HopRow {
        HopRow {
            measurement_id: 1,
            hop_number: n,
            hop_ip: asn.map(|_| format!("192.0.2.{}", n)),
            rtt_ms: rtt,
            asn,
        }
    }

    #[test]
    fn test_collapse_runs_and_nulls() {
        // [A, A, null, B, B, C] -> [A, B, C]
        let hops = vec![
            hop(1, Some(64500), Some(1.0)),
            hop(2, Some(64500), Some(2.0)),
            hop(3, None, None),
            hop(4, Some(64501), Some(5.0)),
            hop(5, Some(64501), Some(6.0)),
            hop(6, Some(64502), Some(9.0)),
        ];
        let spans = collapse_asn_sequence(&hops);
        assert_eq!(
            spans.iter().map(|s| s.asn).collect_vec(),
            vec![64500, 64501, 64502]
        );
        // First-hop RTT of each run survives
        assert_eq!(spans[0].first_rtt_ms, Some(1.0));
        assert_eq!(spans[1].first_rtt_ms, Some(5.0));
    }

    #[test]
    fn test_opaque_gap_still_produces_adjacency() {
        // A timed-out hop between two resolved ASNs: direct edge A -> B
        let hops = vec![
            hop(1, Some(64500), Some(0.5)),
            hop(2, None, None),
            hop(3, Some(64501), Some(8.0)),
        ];
        let edges = edges_of(&collapse_asn_sequence(&hops));
        assert_eq!(edges, vec![(64500, 64501, Some(8.0))]);
    }

    #[test]
    fn test_contiguous_same_asn_around_gap_does_not_self_edge() {
        // [A, null, A, B]: the gap inside A must not synthesize A -> A
        let hops = vec![
            hop(1, Some(64500), Some(0.5)),
            hop(2, None, None),
            hop(3, Some(64500), Some(0.9)),
            hop(4, Some(64501), Some(4.0)),
        ];
        let edges = edges_of(&collapse_asn_sequence(&hops));
        assert_eq!(edges, vec![(64500, 64501, Some(4.0))]);
    }

    #[test]
    fn test_unsorted_hops_are_ordered_by_hop_number() {
        let hops = vec![
            hop(4, Some(64501), Some(4.0)),
            hop(1, Some(64500), Some(0.5)),
            hop(2, Some(64500), Some(0.7)),
        ];
        let spans = collapse_asn_sequence(&hops);
        assert_eq!(spans.iter().map(|s| s.asn).collect_vec(), vec![64500, 64501]);
    }

    #[test]
    fn test_flapping_path_counts_each_edge_once() {
        // A -> B -> A -> B: edge (A,B) appears once, (B,A) once
        let spans = vec![
            AsnSpan { asn: 1, first_rtt_ms: Some(1.0) },
            AsnSpan { asn: 2, first_rtt_ms: Some(2.0) },
            AsnSpan { asn: 1, first_rtt_ms: Some(3.0) },
            AsnSpan { asn: 2, first_rtt_ms: Some(4.0) },
        ];
        let edges = edges_of(&spans);
        assert_eq!(
            edges,
            vec![(1, 2, Some(2.0)), (2, 1, Some(3.0))]
        );
    }

    #[test]
    fn test_empty_and_single_span_sequences() {
        assert!(edges_of(&[]).is_empty());
        assert!(edges_of(&[AsnSpan { asn: 1, first_rtt_ms: None }]).is_empty());
        assert!(collapse_asn_sequence(&[hop(1, None, None)]).is_empty());
    }

    #[test]
    fn test_edge_rtt_can_be_absent() {
        let hops = vec![hop(1, Some(1), Some(0.4)), hop(2, Some(2), None)];
        let edges = edges_of(&collapse_asn_sequence(&hops));
        assert_eq!(edges, vec![(1, 2, None)]);
    }
}

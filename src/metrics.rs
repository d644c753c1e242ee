// src/metrics.rs
//
// Metrics facade. With the `observability` feature enabled these register
// real Prometheus series; without it every helper compiles to a no-op so
// call sites stay unconditional.

/// Initializes the descriptions for all metrics in the node.
/// This should be called once at startup.
pub fn describe_metrics() {
    #[cfg(feature = "observability")]
    {
        use metrics::Unit;

        metrics::describe_gauge!("tracemap_queue_depth", "Pending tasks in the target queue.");
        metrics::describe_gauge!(
            "tracemap_queue_oldest_age_seconds",
            "Age of the oldest pending task in seconds."
        );
        metrics::describe_counter!(
            "tracemap_enqueue_total",
            Unit::Count,
            "Enqueue attempts, labeled by source and outcome (accepted/deduped)."
        );
        metrics::describe_counter!(
            "tracemap_probes_launched_total",
            Unit::Count,
            "Probe subprocesses launched, labeled by tool."
        );
        metrics::describe_counter!(
            "tracemap_probe_failures_total",
            Unit::Count,
            "Failed probes, labeled by reason (timeout/unsuccessful)."
        );
        metrics::describe_counter!(
            "tracemap_hops_persisted_total",
            Unit::Count,
            "Hop rows written to the measurement store."
        );
        metrics::describe_counter!(
            "tracemap_asn_lookups_total",
            Unit::Count,
            "ASN lookups, labeled by the source that resolved them (or 'failed')."
        );
        metrics::describe_counter!(
            "tracemap_asn_cache_events_total",
            Unit::Count,
            "asns cache probes, labeled hit/miss."
        );
        metrics::describe_counter!(
            "tracemap_measurements_enriched_total",
            Unit::Count,
            "Measurements marked enriched."
        );
        metrics::describe_counter!(
            "tracemap_graph_edges_upserted_total",
            Unit::Count,
            "AS edge upserts performed by the graph projector."
        );
        metrics::describe_counter!(
            "tracemap_remeasure_enqueued_total",
            Unit::Count,
            "Targets re-enqueued by the remeasurement scheduler."
        );
        metrics::describe_counter!(
            "tracemap_dns_targets_total",
            Unit::Count,
            "Probe targets produced by the DNS collector."
        );
    }
}

pub fn increment_enqueue(source: &str, outcome: &str) {
    #[cfg(feature = "observability")]
    metrics::increment_counter!(
        "tracemap_enqueue_total",
        "source" => source.to_string(),
        "outcome" => outcome.to_string()
    );
    #[cfg(not(feature = "observability"))]
    let _ = (source, outcome);
}

pub fn set_queue_depth(depth: f64) {
    #[cfg(feature = "observability")]
    metrics::gauge!("tracemap_queue_depth", depth);
    #[cfg(not(feature = "observability"))]
    let _ = depth;
}

pub fn set_queue_oldest_age_seconds(age: f64) {
    #[cfg(feature = "observability")]
    metrics::gauge!("tracemap_queue_oldest_age_seconds", age);
    #[cfg(not(feature = "observability"))]
    let _ = age;
}

pub fn increment_probes_launched(tool: &str) {
    #[cfg(feature = "observability")]
    metrics::increment_counter!("tracemap_probes_launched_total", "tool" => tool.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = tool;
}

pub fn increment_probe_failures(reason: &str) {
    #[cfg(feature = "observability")]
    metrics::increment_counter!("tracemap_probe_failures_total", "reason" => reason.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = reason;
}

pub fn record_hops_persisted(count: u64) {
    #[cfg(feature = "observability")]
    metrics::counter!("tracemap_hops_persisted_total", count);
    #[cfg(not(feature = "observability"))]
    let _ = count;
}

pub fn increment_lookup(source: &str) {
    #[cfg(feature = "observability")]
    metrics::increment_counter!("tracemap_asn_lookups_total", "source" => source.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = source;
}

pub fn increment_cache_event(kind: &str) {
    #[cfg(feature = "observability")]
    metrics::increment_counter!("tracemap_asn_cache_events_total", "kind" => kind.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = kind;
}

pub fn record_measurements_enriched(count: u64) {
    #[cfg(feature = "observability")]
    metrics::counter!("tracemap_measurements_enriched_total", count);
    #[cfg(not(feature = "observability"))]
    let _ = count;
}

pub fn record_edges_upserted(count: u64) {
    #[cfg(feature = "observability")]
    metrics::counter!("tracemap_graph_edges_upserted_total", count);
    #[cfg(not(feature = "observability"))]
    let _ = count;
}

pub fn record_remeasure_enqueued(count: u64) {
    #[cfg(feature = "observability")]
    metrics::counter!("tracemap_remeasure_enqueued_total", count);
    #[cfg(not(feature = "observability"))]
    let _ = count;
}

pub fn increment_dns_targets() {
    #[cfg(feature = "observability")]
    metrics::increment_counter!("tracemap_dns_targets_total");
}

//! # Tracemap Node
//!
//! An autonomous internet-measurement and topology-mapping node. From a
//! single vantage point it continuously runs active path probes
//! (scamper / traceroute / mtr), persists hop-by-hop results, enriches hop
//! IPs with AS metadata from multiple external sources, and projects the
//! observed IP paths into an AS-level graph.
//!
//! ## Pipeline
//!
//! `Producer → Queue → Worker → Store → Enricher → Store + Graph`
//!
//! Targets are fed by three producers: the target ingress contract (HTTP
//! API layer, external to this crate), the DNS collector, and the periodic
//! remeasurement scheduler. Each stage is idempotent and restartable; the
//! monotonic `enriched` and `graph_built` flags on measurements are the
//! only cross-stage coordination.
//!
//! ## Processes
//!
//! Each pipeline stage runs as its own long-lived OS process (see the
//! binaries under `bin/`); within a process, cooperative tasks handle the
//! I/O-bound fan-out (store round-trips, enrichment HTTP calls, probe
//! subprocess waits).

// Core types
/// Shared domain types (tasks, hops, AS lookups)
pub mod types;

// Target intake
/// DNS-derived target collection behind an abstract resolver interface
pub mod dns_collector;
/// Target ingress contract consumed by the API layer
pub mod ingress;
/// Durable FIFO task queue with dedupe and priority classes
pub mod target_queue;

// Measurement
/// Tolerant per-tool stdout parsers
pub mod probe_parser;
/// Trace tool variants and host availability detection
pub mod probe_tools;
/// Worker pool turning queue tasks into measurement rows
pub mod probe_worker;
/// Rolling-window probe rate limiting
pub mod rate_limit;

// Enrichment & graph
/// Multi-source ASN enrichment engine
pub mod enrichment;
/// External enrichment source clients (Cymru, PeeringDB, RIPEstat, ...)
pub mod enrichment_sources;
/// AS-graph projection of enriched measurements
pub mod graph_projector;
/// AS graph persistence with atomic edge statistics
pub mod graph_store;
/// Periodic target refresh
pub mod remeasurement;

// Infrastructure
/// Measurement store (PostgreSQL) integration
pub mod database;
/// Metrics and observability
pub mod metrics;
/// Live settings backed by the settings table
pub mod runtime_settings;
/// Bootstrap configuration
pub mod settings;

// Re-exports for convenience
pub use enrichment::EnrichmentEngine;
pub use graph_projector::GraphProjector;
pub use probe_worker::WorkerPool;
pub use remeasurement::RemeasurementScheduler;
pub use runtime_settings::{RuntimeSettings, SharedRuntimeSettings};
pub use settings::Settings;
pub use target_queue::TargetQueue;

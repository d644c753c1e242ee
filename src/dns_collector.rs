// DNS collector - turns locally-observed resolver traffic into probe targets.
//
// Concrete resolver adapters (Pi-hole, log tail, ...) live outside this
// crate and implement `DnsSource`. The collector applies the suffix, qtype,
// client and length filters, resolves surviving domains to A/AAAA records
// (capped per domain), and enqueues each IP with source="dns". Client IPs
// participate in filtering only; they are never forwarded past this module
// and never reach the store.

use crate::metrics;
use crate::settings;
use crate::target_queue::{EnqueueOutcome, TargetQueue};
use crate::types::{TaskPriority, TaskSource};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// One observed DNS query, as produced by a resolver adapter.
#[derive(Debug, Clone)]
pub struct DnsObservation {
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub qtype: Option<String>,
    pub client_ip: Option<IpAddr>,
}

/// Abstract stream of resolver observations. `None` means the source is
/// exhausted and the collector should stop.
#[async_trait]
pub trait DnsSource: Send {
    async fn next_observation(&mut self) -> Result<Option<DnsObservation>>;
}

/// Resolution seam, so the collector can be exercised without the network.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>>;
}

/// System resolver via getaddrinfo.
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((domain, 0)).await?;
        let mut seen = HashSet::new();
        Ok(addrs
            .map(|sock| sock.ip())
            .filter(|ip| seen.insert(*ip))
            .collect())
    }
}

/// The suffix / qtype / client / length filters from the collector settings.
pub struct ObservationFilter {
    config: settings::DnsCollector,
    ignored_clients: Vec<IpAddr>,
}

impl ObservationFilter {
    pub fn new(config: settings::DnsCollector) -> Self {
        let ignored_clients = config
            .ignored_clients
            .iter()
            .filter_map(|raw| match raw.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("⚠️ Ignoring unparsable client filter entry '{}'", raw);
                    None
                }
            })
            .collect();
        Self {
            config,
            ignored_clients,
        }
    }

    pub fn accepts(&self, obs: &DnsObservation) -> bool {
        let domain = obs.domain.trim().trim_end_matches('.');
        if domain.is_empty() || domain.len() > self.config.max_domain_length {
            return false;
        }
        // Bare IPs queried as names are already targets; skip them here
        if domain.parse::<IpAddr>().is_ok() {
            return false;
        }
        let lower = domain.to_ascii_lowercase();
        if self
            .config
            .ignored_suffixes
            .iter()
            .any(|suffix| lower.ends_with(&suffix.to_ascii_lowercase()))
        {
            return false;
        }
        if !self.config.allowed_qtypes.is_empty() {
            if let Some(qtype) = &obs.qtype {
                if !self
                    .config
                    .allowed_qtypes
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(qtype))
                {
                    return false;
                }
            }
        }
        if let Some(client) = obs.client_ip {
            if self.ignored_clients.contains(&client) {
                return false;
            }
        }
        true
    }
}

pub struct DnsCollectorService<S: DnsSource> {
    source: S,
    filter: ObservationFilter,
    resolver: Arc<dyn Resolver>,
    queue: Arc<TargetQueue>,
    max_ips_per_domain: usize,
}

impl<S: DnsSource> DnsCollectorService<S> {
    pub fn new(
        source: S,
        config: settings::DnsCollector,
        queue: Arc<TargetQueue>,
    ) -> Self {
        let max_ips_per_domain = config.max_ips_per_domain;
        Self {
            source,
            filter: ObservationFilter::new(config),
            resolver: Arc::new(SystemResolver),
            queue,
            max_ips_per_domain,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Consume the observation stream until it ends or shutdown flips.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) {
        info!("🚀 DNS collector started");
        while !*shutdown.borrow() {
            let observation = match self.source.next_observation().await {
                Ok(Some(obs)) => obs,
                Ok(None) => {
                    info!("DNS source exhausted, collector stopping");
                    break;
                }
                Err(e) => {
                    error!("❌ DNS source error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            if let Err(e) = self.process_observation(&observation).await {
                warn!("⚠️ Failed to process observation for '{}': {}", observation.domain, e);
            }
        }
        info!("✅ DNS collector stopped");
    }

    async fn process_observation(&self, obs: &DnsObservation) -> Result<()> {
        if !self.filter.accepts(obs) {
            return Ok(());
        }
        let domain = obs.domain.trim().trim_end_matches('.');
        let ips = self.resolver.resolve(domain).await?;
        for ip in ips.into_iter().take(self.max_ips_per_domain) {
            match self
                .queue
                .enqueue(ip, TaskSource::Dns, TaskPriority::Normal, None)
                .await
            {
                Ok(EnqueueOutcome::Accepted) => {
                    debug!("DNS target {} from '{}'", ip, domain);
                    metrics::increment_dns_targets();
                }
                Ok(EnqueueOutcome::Deduped) => {}
                Err(e) => {
                    warn!("⚠️ Enqueue of DNS target {} failed: {}", ip, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(domain: &str) -> DnsObservation {
        DnsObservation {
            domain: domain.to_string(),
            timestamp: Utc::now(),
            qtype: Some("A".to_string()),
            client_ip: Some("192.168.1.50".parse().unwrap()),
        }
    }

    fn default_filter() -> ObservationFilter {
        ObservationFilter::new(settings::DnsCollector::default())
    }

    #[test]
    fn test_filter_accepts_plain_domain() {
        assert!(default_filter().accepts(&obs("example.com")));
        // Trailing dot is tolerated
        assert!(default_filter().accepts(&obs("example.com.")));
    }

    #[test]
    fn test_filter_rejects_ignored_suffixes() {
        let filter = default_filter();
        assert!(!filter.accepts(&obs("1.1.168.192.in-addr.arpa")));
        assert!(!filter.accepts(&obs("printer.local")));
        assert!(!filter.accepts(&obs("host.IP6.ARPA")));
    }

    #[test]
    fn test_filter_rejects_bare_ips_and_empty() {
        let filter = default_filter();
        assert!(!filter.accepts(&obs("8.8.8.8")));
        assert!(!filter.accepts(&obs("")));
        assert!(!filter.accepts(&obs("   ")));
    }

    #[test]
    fn test_filter_rejects_overlong_domains() {
        let long = format!("{}.com", "a".repeat(300));
        assert!(!default_filter().accepts(&obs(&long)));
    }

    #[test]
    fn test_filter_qtype_gate() {
        let filter = default_filter();
        let mut o = obs("example.com");
        o.qtype = Some("PTR".to_string());
        assert!(!filter.accepts(&o));
        o.qtype = Some("aaaa".to_string());
        assert!(filter.accepts(&o), "qtype match is case-insensitive");
        // Unknown qtype information passes (filtering is best-effort)
        o.qtype = None;
        assert!(filter.accepts(&o));
    }

    #[test]
    fn test_filter_ignored_clients() {
        let mut config = settings::DnsCollector::default();
        config.ignored_clients = vec!["192.168.1.50".to_string(), "not-an-ip".to_string()];
        let filter = ObservationFilter::new(config);
        assert!(!filter.accepts(&obs("example.com")));

        let mut other = obs("example.com");
        other.client_ip = Some("192.168.1.51".parse().unwrap());
        assert!(filter.accepts(&other));
    }
}

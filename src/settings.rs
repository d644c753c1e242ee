use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_acquire_timeout_seconds() -> u64 {
    5
}

impl Default for Database {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_seconds: default_acquire_timeout_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Queue {
    /// Window over which identical (target_ip, source, priority) submissions
    /// are collapsed into one pending task.
    #[serde(default = "default_dedupe_window_seconds")]
    pub dedupe_window_seconds: u64,
    /// Poll cadence while a worker blocks on `dequeue`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Claimed tasks older than this are assumed lost to a worker crash and
    /// made claimable again.
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u64,
}

fn default_dedupe_window_seconds() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_visibility_timeout_seconds() -> u64 {
    300
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            dedupe_window_seconds: default_dedupe_window_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_seconds: default_visibility_timeout_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Worker {
    #[serde(default = "default_dequeue_timeout_seconds")]
    pub dequeue_timeout_seconds: u64,
    /// Back-off before re-checking tool availability when no probe tool is
    /// present on the host.
    #[serde(default = "default_tool_backoff_seconds")]
    pub tool_backoff_seconds: u64,
    /// Grace window for draining in-flight probes on shutdown.
    #[serde(default = "default_drain_grace_seconds")]
    pub drain_grace_seconds: u64,
    /// Sample count passed to mtr (`-c <count>`).
    #[serde(default = "default_mtr_sample_count")]
    pub mtr_sample_count: u32,
}

fn default_dequeue_timeout_seconds() -> u64 {
    5
}
fn default_tool_backoff_seconds() -> u64 {
    30
}
fn default_drain_grace_seconds() -> u64 {
    30
}
fn default_mtr_sample_count() -> u32 {
    4
}

impl Default for Worker {
    fn default() -> Self {
        Self {
            dequeue_timeout_seconds: default_dequeue_timeout_seconds(),
            tool_backoff_seconds: default_tool_backoff_seconds(),
            drain_grace_seconds: default_drain_grace_seconds(),
            mtr_sample_count: default_mtr_sample_count(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Enrichment {
    #[serde(default = "default_cycle_sleep_seconds")]
    pub cycle_sleep_seconds: u64,
    /// Per-call timeout against any single external source.
    #[serde(default = "default_source_timeout_seconds")]
    pub source_timeout_seconds: u64,
    #[serde(default = "default_cymru_whois_host")]
    pub cymru_whois_host: String,
    #[serde(default = "default_peeringdb_base_url")]
    pub peeringdb_base_url: String,
    #[serde(default = "default_ripestat_base_url")]
    pub ripestat_base_url: String,
    #[serde(default = "default_ip_api_base_url")]
    pub ip_api_base_url: String,
    #[serde(default = "default_ipinfo_base_url")]
    pub ipinfo_base_url: String,
    /// Optional ipinfo.io token; unauthenticated lookups are heavily
    /// throttled upstream.
    #[serde(default)]
    pub ipinfo_token: Option<String>,
    /// ip-api.com free tier allows 45 requests per minute.
    #[serde(default = "default_ip_api_rate_per_minute")]
    pub ip_api_rate_per_minute: u32,
    /// Capacity of the in-process lookup memo (entries).
    #[serde(default = "default_lookup_memo_capacity")]
    pub lookup_memo_capacity: usize,
}

fn default_cycle_sleep_seconds() -> u64 {
    15
}
fn default_source_timeout_seconds() -> u64 {
    3
}
fn default_cymru_whois_host() -> String {
    "whois.cymru.com:43".to_string()
}
fn default_peeringdb_base_url() -> String {
    "https://www.peeringdb.com/api".to_string()
}
fn default_ripestat_base_url() -> String {
    "https://stat.ripe.net/data".to_string()
}
fn default_ip_api_base_url() -> String {
    "http://ip-api.com/json".to_string()
}
fn default_ipinfo_base_url() -> String {
    "https://ipinfo.io".to_string()
}
fn default_ip_api_rate_per_minute() -> u32 {
    45
}
fn default_lookup_memo_capacity() -> usize {
    4096
}

impl Default for Enrichment {
    fn default() -> Self {
        Self {
            cycle_sleep_seconds: default_cycle_sleep_seconds(),
            source_timeout_seconds: default_source_timeout_seconds(),
            cymru_whois_host: default_cymru_whois_host(),
            peeringdb_base_url: default_peeringdb_base_url(),
            ripestat_base_url: default_ripestat_base_url(),
            ip_api_base_url: default_ip_api_base_url(),
            ipinfo_base_url: default_ipinfo_base_url(),
            ipinfo_token: None,
            ip_api_rate_per_minute: default_ip_api_rate_per_minute(),
            lookup_memo_capacity: default_lookup_memo_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Graph {
    #[serde(default = "default_graph_cycle_sleep_seconds")]
    pub cycle_sleep_seconds: u64,
    #[serde(default = "default_graph_batch_size")]
    pub batch_size: i64,
}

fn default_graph_cycle_sleep_seconds() -> u64 {
    15
}
fn default_graph_batch_size() -> i64 {
    100
}

impl Default for Graph {
    fn default() -> Self {
        Self {
            cycle_sleep_seconds: default_graph_cycle_sleep_seconds(),
            batch_size: default_graph_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsCollector {
    /// Domains ending in any of these suffixes are ignored (reverse zones,
    /// mDNS noise).
    #[serde(default = "default_ignored_suffixes")]
    pub ignored_suffixes: Vec<String>,
    /// Empty list means all query types pass.
    #[serde(default = "default_allowed_qtypes")]
    pub allowed_qtypes: Vec<String>,
    /// Observations from these client IPs are dropped before any processing.
    #[serde(default)]
    pub ignored_clients: Vec<String>,
    #[serde(default = "default_max_domain_length")]
    pub max_domain_length: usize,
    #[serde(default = "default_max_ips_per_domain")]
    pub max_ips_per_domain: usize,
}

fn default_ignored_suffixes() -> Vec<String> {
    vec![
        ".in-addr.arpa".to_string(),
        ".ip6.arpa".to_string(),
        ".local".to_string(),
    ]
}
fn default_allowed_qtypes() -> Vec<String> {
    vec!["A".to_string(), "AAAA".to_string()]
}
fn default_max_domain_length() -> usize {
    253
}
fn default_max_ips_per_domain() -> usize {
    4
}

impl Default for DnsCollector {
    fn default() -> Self {
        Self {
            ignored_suffixes: default_ignored_suffixes(),
            allowed_qtypes: default_allowed_qtypes(),
            ignored_clients: Vec::new(),
            max_domain_length: default_max_domain_length(),
            max_ips_per_domain: default_max_ips_per_domain(),
        }
    }
}

/// Bootstrap configuration loaded once at process start. Live pipeline
/// tuning (rate limits, batch sizes, TTLs) lives in the `settings` table
/// and is re-read every cycle, see `runtime_settings`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub worker: Worker,
    #[serde(default)]
    pub enrichment: Enrichment,
    #[serde(default)]
    pub graph: Graph,
    #[serde(default)]
    pub dns_collector: DnsCollector,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Environment overrides for secrets and deployment-specific knobs
        if let Ok(token) = env::var("TRACEMAP_IPINFO_TOKEN") {
            let trimmed = token.trim();
            if !trimmed.is_empty() {
                settings.enrichment.ipinfo_token = Some(trimmed.to_string());
            }
        }
        if let Ok(host) = env::var("TRACEMAP_CYMRU_WHOIS_HOST") {
            let trimmed = host.trim();
            if !trimmed.is_empty() {
                settings.enrichment.cymru_whois_host = trimmed.to_string();
            }
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_config_file() {
        let settings = Settings::default();
        assert_eq!(settings.queue.dedupe_window_seconds, 60);
        assert_eq!(settings.worker.tool_backoff_seconds, 30);
        assert_eq!(settings.worker.drain_grace_seconds, 30);
        assert_eq!(settings.enrichment.source_timeout_seconds, 3);
        assert_eq!(settings.enrichment.ip_api_rate_per_minute, 45);
        assert_eq!(settings.dns_collector.max_ips_per_domain, 4);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let s = Config::builder()
            .add_source(config::File::from_str(
                "[queue]\ndedupe_window_seconds = 120\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let settings: Settings = s.try_deserialize().unwrap();
        assert_eq!(settings.queue.dedupe_window_seconds, 120);
        assert_eq!(settings.queue.poll_interval_ms, 250);
        assert_eq!(settings.enrichment.cymru_whois_host, "whois.cymru.com:43");
    }
}

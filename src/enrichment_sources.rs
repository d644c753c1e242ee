// Enrichment sources - external AS-metadata lookups behind one contract.
//
// The variant set: Team Cymru WHOIS (TCP bulk interface), PeeringDB (by
// ASN), RIPEstat, ip-api and ipinfo as fallbacks. All are best-effort; any
// may be offline. Every call is bounded by a per-source timeout and a
// failure is a value, never a panic.

use crate::types::{AsLookup, PeeringDbFields};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use serde::Deserialize;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected response: {0}")]
    Parse(String),
    #[error("source returned no data")]
    NoData,
    #[error("local rate limit reached")]
    RateLimited,
}

/// Uniform contract for IP-keyed sources. PeeringDB is ASN-keyed and has
/// its own client below.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn lookup_ip(&self, ip: IpAddr) -> Result<AsLookup, SourceError>;
}

// ---------------------------------------------------------------------------
// Team Cymru WHOIS
// ---------------------------------------------------------------------------

/// Team Cymru's IP-to-ASN bulk WHOIS service (port 43, `begin`/`end`
/// framing, pipe-delimited verbose rows).
pub struct CymruWhois {
    host: String,
    timeout: Duration,
}

impl CymruWhois {
    pub fn new(host: String, timeout: Duration) -> Self {
        Self { host, timeout }
    }

    async fn query(&self, ip: IpAddr) -> Result<String, SourceError> {
        let mut stream = TcpStream::connect(&self.host).await?;
        let request = format!("begin\nverbose\n{}\nend\n", ip);
        stream.write_all(request.as_bytes()).await?;
        stream.shutdown().await.ok();
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok(response)
    }
}

#[async_trait]
impl EnrichmentSource for CymruWhois {
    fn name(&self) -> &'static str {
        "cymru"
    }

    async fn lookup_ip(&self, ip: IpAddr) -> Result<AsLookup, SourceError> {
        let response = tokio::time::timeout(self.timeout, self.query(ip))
            .await
            .map_err(|_| SourceError::Timeout)??;
        parse_cymru_response(&response)
    }
}

/// Verbose rows look like:
///
/// ```text
/// AS      | IP               | BGP Prefix          | CC | Registry | Allocated  | AS Name
/// 13335   | 1.1.1.1          | 1.1.1.0/24          | US | arin     | 2010-07-14 | CLOUDFLARENET, US
/// ```
///
/// `NA` marks a missing column. Multi-origin answers list several ASNs in
/// the first column; the first is kept.
fn parse_cymru_response(response: &str) -> Result<AsLookup, SourceError> {
    for line in response.lines() {
        let columns: Vec<&str> = line.split('|').map(str::trim).collect();
        if columns.len() < 7 {
            continue;
        }
        // Header row and bulk-mode banner lead with non-numeric text
        let Some(asn) = columns[0]
            .split_whitespace()
            .next()
            .and_then(|t| t.parse::<i64>().ok())
        else {
            continue;
        };
        let field = |idx: usize| -> Option<String> {
            let v = columns[idx];
            if v.is_empty() || v == "NA" {
                None
            } else {
                Some(v.to_string())
            }
        };
        return Ok(AsLookup {
            asn: Some(asn),
            prefix: field(2),
            country_code: field(3),
            org_name: field(6),
        });
    }
    Err(SourceError::NoData)
}

// ---------------------------------------------------------------------------
// PeeringDB
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct PeeringDbRecord {
    pub org_name: Option<String>,
    pub fields: PeeringDbFields,
}

#[derive(Debug, Deserialize)]
struct PeeringDbResponse {
    #[serde(default)]
    data: Vec<PeeringDbNet>,
}

#[derive(Debug, Deserialize)]
struct PeeringDbNet {
    id: i64,
    name: Option<String>,
    #[serde(default)]
    irr_as_set: Option<String>,
    #[serde(default)]
    info_traffic: Option<String>,
    #[serde(default)]
    policy_general: Option<String>,
    #[serde(default)]
    fac_count: Option<i32>,
}

pub struct PeeringDbClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl PeeringDbClient {
    pub fn new(client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            timeout,
        }
    }

    pub async fn lookup_asn(&self, asn: i64) -> Result<PeeringDbRecord, SourceError> {
        let url = format!("{}/net?asn={}", self.base_url, asn);
        let response = tokio::time::timeout(
            self.timeout,
            async {
                self.client
                    .get(&url)
                    .send()
                    .await?
                    .json::<PeeringDbResponse>()
                    .await
            },
        )
        .await
        .map_err(|_| SourceError::Timeout)??;

        let net = response.data.into_iter().next().ok_or(SourceError::NoData)?;
        debug!("PeeringDB: AS{} -> net {}", asn, net.id);
        Ok(PeeringDbRecord {
            org_name: net.name.filter(|n| !n.is_empty()),
            fields: PeeringDbFields {
                peeringdb_id: Some(net.id),
                facility_count: net.fac_count,
                peering_policy: net.policy_general.filter(|p| !p.is_empty()),
                traffic_levels: net.info_traffic.filter(|t| !t.is_empty()),
                irr_as_set: net.irr_as_set.filter(|s| !s.is_empty()),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// RIPEstat
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RipeStatEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct RipeNetworkInfo {
    #[serde(default)]
    asns: Vec<String>,
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RipeRoutingStatus {
    #[serde(default)]
    announced_space: Option<RipeAnnouncedSpace>,
    #[serde(default)]
    observed_neighbours: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct RipeAnnouncedSpace {
    #[serde(default)]
    v4: Option<RipePrefixCount>,
    #[serde(default)]
    v6: Option<RipePrefixCount>,
}

#[derive(Debug, Deserialize)]
struct RipePrefixCount {
    #[serde(default)]
    prefixes: Option<i32>,
}

pub struct RipeStat {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl RipeStat {
    pub fn new(client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            timeout,
        }
    }

    /// Announced prefix count and observed neighbour count for an ASN, used
    /// to keep the asns table's topology columns fresh. Best-effort.
    pub async fn routing_status(&self, asn: i64) -> Result<(Option<i32>, Option<i32>), SourceError> {
        let url = format!("{}/routing-status/data.json?resource=AS{}", self.base_url, asn);
        let envelope = tokio::time::timeout(
            self.timeout,
            async {
                self.client
                    .get(&url)
                    .send()
                    .await?
                    .json::<RipeStatEnvelope<RipeRoutingStatus>>()
                    .await
            },
        )
        .await
        .map_err(|_| SourceError::Timeout)??;

        let prefix_count = envelope.data.announced_space.map(|space| {
            space.v4.and_then(|v| v.prefixes).unwrap_or(0)
                + space.v6.and_then(|v| v.prefixes).unwrap_or(0)
        });
        Ok((prefix_count, envelope.data.observed_neighbours))
    }
}

#[async_trait]
impl EnrichmentSource for RipeStat {
    fn name(&self) -> &'static str {
        "ripe"
    }

    async fn lookup_ip(&self, ip: IpAddr) -> Result<AsLookup, SourceError> {
        let url = format!("{}/network-info/data.json?resource={}", self.base_url, ip);
        let envelope = tokio::time::timeout(
            self.timeout,
            async {
                self.client
                    .get(&url)
                    .send()
                    .await?
                    .json::<RipeStatEnvelope<RipeNetworkInfo>>()
                    .await
            },
        )
        .await
        .map_err(|_| SourceError::Timeout)??;

        let asn = envelope
            .data
            .asns
            .first()
            .and_then(|a| a.parse::<i64>().ok());
        if asn.is_none() && envelope.data.prefix.is_none() {
            return Err(SourceError::NoData);
        }
        Ok(AsLookup {
            asn,
            prefix: envelope.data.prefix,
            org_name: None,
            country_code: None,
        })
    }
}

// ---------------------------------------------------------------------------
// ip-api.com
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "countryCode")]
    country_code: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[serde(default, rename = "as")]
    as_field: Option<String>,
}

pub struct IpApi {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    // ip-api's free tier enforces 45 requests/minute per source address;
    // blowing through it earns a temporary ban.
    limiter: DirectRateLimiter,
}

impl IpApi {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        timeout: Duration,
        rate_per_minute: u32,
    ) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(rate_per_minute.max(1)).unwrap_or(NonZeroU32::MIN),
        );
        Self {
            client,
            base_url,
            timeout,
            limiter: RateLimiter::direct(quota),
        }
    }
}

#[async_trait]
impl EnrichmentSource for IpApi {
    fn name(&self) -> &'static str {
        "ip-api"
    }

    async fn lookup_ip(&self, ip: IpAddr) -> Result<AsLookup, SourceError> {
        // Skip rather than queue: the next cycle retries, and the other
        // fallbacks are still in play for this one.
        if self.limiter.check().is_err() {
            return Err(SourceError::RateLimited);
        }
        let url = format!(
            "{}/{}?fields=status,message,countryCode,org,as",
            self.base_url, ip
        );
        let response = tokio::time::timeout(
            self.timeout,
            async {
                self.client
                    .get(&url)
                    .send()
                    .await?
                    .json::<IpApiResponse>()
                    .await
            },
        )
        .await
        .map_err(|_| SourceError::Timeout)??;

        if response.status != "success" {
            return Err(SourceError::Parse(
                response.message.unwrap_or_else(|| "status=fail".to_string()),
            ));
        }
        let (asn, as_org) = split_as_field(response.as_field.as_deref());
        Ok(AsLookup {
            asn,
            org_name: response.org.filter(|o| !o.is_empty()).or(as_org),
            country_code: response.country_code.filter(|c| !c.is_empty()),
            prefix: None,
        })
    }
}

// ---------------------------------------------------------------------------
// ipinfo.io
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

pub struct IpInfo {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    token: Option<String>,
}

impl IpInfo {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        timeout: Duration,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url,
            timeout,
            token,
        }
    }
}

#[async_trait]
impl EnrichmentSource for IpInfo {
    fn name(&self) -> &'static str {
        "ipinfo"
    }

    async fn lookup_ip(&self, ip: IpAddr) -> Result<AsLookup, SourceError> {
        let mut url = format!("{}/{}/json", self.base_url, ip);
        if let Some(token) = &self.token {
            url.push_str("?token=");
            url.push_str(token);
        }
        let response = tokio::time::timeout(
            self.timeout,
            async {
                self.client
                    .get(&url)
                    .send()
                    .await?
                    .json::<IpInfoResponse>()
                    .await
            },
        )
        .await
        .map_err(|_| SourceError::Timeout)??;

        let (asn, org_name) = split_as_field(response.org.as_deref());
        if asn.is_none() && org_name.is_none() {
            return Err(SourceError::NoData);
        }
        Ok(AsLookup {
            asn,
            org_name,
            country_code: response.country.filter(|c| !c.is_empty()),
            prefix: None,
        })
    }
}

/// Split a combined "AS13335 Cloudflare, Inc." field into the ASN and the
/// organization remainder.
fn split_as_field(field: Option<&str>) -> (Option<i64>, Option<String>) {
    let Some(field) = field else {
        return (None, None);
    };
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or_default();
    let rest = parts.next().map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
    let asn = head
        .strip_prefix("AS")
        .or_else(|| head.strip_prefix("as"))
        .and_then(|n| n.parse::<i64>().ok());
    if asn.is_some() {
        (asn, rest)
    } else {
        // No AS prefix, the whole field is an org name
        (None, Some(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cymru_verbose_row() {
        let response = "\
Bulk mode; whois.cymru.com [2024-01-01 00:00:00 +0000]
AS      | IP               | BGP Prefix          | CC | Registry | Allocated  | AS Name
13335   | 1.1.1.1          | 1.1.1.0/24          | US | arin     | 2010-07-14 | CLOUDFLARENET, US
";
        let lookup = parse_cymru_response(response).unwrap();
        assert_eq!(lookup.asn, Some(13335));
        assert_eq!(lookup.prefix.as_deref(), Some("1.1.1.0/24"));
        assert_eq!(lookup.country_code.as_deref(), Some("US"));
        assert_eq!(lookup.org_name.as_deref(), Some("CLOUDFLARENET, US"));
    }

    #[test]
    fn test_parse_cymru_na_columns_and_moas() {
        let response =
            "13335 174 | 1.1.1.1 | 1.1.1.0/24 | NA | arin | NA | CLOUDFLARENET, US\n";
        let lookup = parse_cymru_response(response).unwrap();
        assert_eq!(lookup.asn, Some(13335), "first origin wins for MOAS rows");
        assert_eq!(lookup.country_code, None);
    }

    #[test]
    fn test_parse_cymru_no_data() {
        assert!(matches!(
            parse_cymru_response("Error: no match found\n"),
            Err(SourceError::NoData)
        ));
        assert!(matches!(parse_cymru_response(""), Err(SourceError::NoData)));
    }

    #[test]
    fn test_split_as_field() {
        assert_eq!(
            split_as_field(Some("AS13335 Cloudflare, Inc.")),
            (Some(13335), Some("Cloudflare, Inc.".to_string()))
        );
        assert_eq!(split_as_field(Some("AS15169")), (Some(15169), None));
        assert_eq!(
            split_as_field(Some("Google LLC")),
            (None, Some("Google LLC".to_string()))
        );
        assert_eq!(split_as_field(Some("  ")), (None, None));
        assert_eq!(split_as_field(None), (None, None));
    }

    #[test]
    fn test_peeringdb_response_shape() {
        let body = r#"{"data": [{"id": 4224, "name": "Cloudflare", "irr_as_set": "AS-CLOUDFLARE",
            "info_traffic": "10-20Tbps", "policy_general": "Open", "fac_count": 300}]}"#;
        let parsed: PeeringDbResponse = serde_json::from_str(body).unwrap();
        let net = &parsed.data[0];
        assert_eq!(net.id, 4224);
        assert_eq!(net.name.as_deref(), Some("Cloudflare"));
        assert_eq!(net.fac_count, Some(300));
    }

    #[test]
    fn test_peeringdb_response_missing_optional_fields() {
        let body = r#"{"data": [{"id": 1, "name": null}]}"#;
        let parsed: PeeringDbResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data[0].fac_count, None);
    }

    #[test]
    fn test_ripestat_network_info_shape() {
        let body = r#"{"data": {"asns": ["13335"], "prefix": "1.1.1.0/24"}}"#;
        let parsed: RipeStatEnvelope<RipeNetworkInfo> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.asns, vec!["13335"]);
        assert_eq!(parsed.data.prefix.as_deref(), Some("1.1.1.0/24"));
    }

    #[test]
    fn test_ripestat_routing_status_shape() {
        let body = r#"{"data": {"announced_space": {"v4": {"prefixes": 120}, "v6": {"prefixes": 30}},
            "observed_neighbours": 42}}"#;
        let parsed: RipeStatEnvelope<RipeRoutingStatus> = serde_json::from_str(body).unwrap();
        let space = parsed.data.announced_space.unwrap();
        assert_eq!(space.v4.unwrap().prefixes, Some(120));
        assert_eq!(parsed.data.observed_neighbours, Some(42));
    }

    #[test]
    fn test_ip_api_response_shape() {
        let body = r#"{"status": "success", "countryCode": "US",
            "org": "Google Public DNS", "as": "AS15169 Google LLC"}"#;
        let parsed: IpApiResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.status, "success");
        let (asn, _) = split_as_field(parsed.as_field.as_deref());
        assert_eq!(asn, Some(15169));
    }

    #[test]
    fn test_ip_api_local_rate_limit() {
        let api = IpApi::new(
            reqwest::Client::new(),
            "http://ip-api.invalid".to_string(),
            Duration::from_secs(3),
            2,
        );
        // Drain the quota synchronously
        assert!(api.limiter.check().is_ok());
        assert!(api.limiter.check().is_ok());
        assert!(api.limiter.check().is_err());
    }
}

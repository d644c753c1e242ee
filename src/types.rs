// Core domain types shared across the measurement pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Where a probe task originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Static,
    Api,
    Dns,
    Remeasure,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Static => "static",
            TaskSource::Api => "api",
            TaskSource::Dns => "dns",
            TaskSource::Remeasure => "remeasure",
        }
    }
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskSource {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(TaskSource::Static),
            "api" => Ok(TaskSource::Api),
            "dns" => Ok(TaskSource::Dns),
            "remeasure" => Ok(TaskSource::Remeasure),
            other => Err(TypeParseError::UnknownSource(other.to_string())),
        }
    }
}

/// Priority class of a queued task. Higher classes strictly precede lower
/// ones at dequeue time; ordering within a class is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl TaskPriority {
    pub fn as_i16(&self) -> i16 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 1,
            TaskPriority::High => 2,
        }
    }

    pub fn from_i16(v: i16) -> Self {
        match v {
            i16::MIN..=0 => TaskPriority::Low,
            1 => TaskPriority::Normal,
            _ => TaskPriority::High,
        }
    }
}

/// A probe task as handed to a worker by the target queue.
#[derive(Debug, Clone)]
pub struct ProbeTask {
    /// Queue row id, used to ack the task once the measurement is reserved.
    pub id: i64,
    pub target_ip: IpAddr,
    pub source: TaskSource,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

/// One hop parsed from probe tool stdout. `ip` absent means the hop timed
/// out (`* * *` in traceroute, `???` in mtr); `rtt_ms` is the mean of the
/// samples the tool produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedHop {
    pub hop_number: i32,
    pub ip: Option<IpAddr>,
    pub rtt_ms: Option<f64>,
}

/// Partial AS record as returned by a single enrichment source. Fields a
/// source does not provide stay `None`; the merge procedure combines
/// records from several sources under a fixed field priority.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsLookup {
    pub asn: Option<i64>,
    pub org_name: Option<String>,
    pub country_code: Option<String>,
    pub prefix: Option<String>,
}

impl AsLookup {
    pub fn is_empty(&self) -> bool {
        self.asn.is_none()
            && self.org_name.is_none()
            && self.country_code.is_none()
            && self.prefix.is_none()
    }

    /// Fill fields that are still `None` from a lower-priority record.
    pub fn fill_missing_from(&mut self, lower: &AsLookup) {
        if self.asn.is_none() {
            self.asn = lower.asn;
        }
        if self.org_name.is_none() {
            self.org_name = lower.org_name.clone();
        }
        if self.country_code.is_none() {
            self.country_code = lower.country_code.clone();
        }
        if self.prefix.is_none() {
            self.prefix = lower.prefix.clone();
        }
    }
}

/// PeeringDB-specific fields kept alongside the core AS record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeeringDbFields {
    pub peeringdb_id: Option<i64>,
    pub facility_count: Option<i32>,
    pub peering_policy: Option<String>,
    pub traffic_levels: Option<String>,
    pub irr_as_set: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TypeParseError {
    #[error("unknown task source '{0}'")]
    UnknownSource(String),
    #[error("invalid IP address '{0}'")]
    InvalidIp(String),
}

/// Parse and canonicalize an IP address to its textual v4/v6 form.
///
/// `std::net::IpAddr` round-trips through the canonical representation, so
/// parsing alone normalizes zero-padding, case, and compressed v6 groups.
pub fn canonicalize_ip(raw: &str) -> Result<IpAddr, TypeParseError> {
    raw.trim()
        .parse::<IpAddr>()
        .map_err(|_| TypeParseError::InvalidIp(raw.to_string()))
}

/// Whether an IP is worth sending to external enrichment sources. Private,
/// loopback, link-local and unspecified addresses have no public ASN.
pub fn is_enrichable_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            // fc00::/7 (unique local) and fe80::/10 (link local)
            let seg = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (seg & 0xfe00) == 0xfc00
                || (seg & 0xffc0) == 0xfe80)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_ip() {
        assert_eq!(
            canonicalize_ip("1.1.1.1").unwrap().to_string(),
            "1.1.1.1"
        );
        assert_eq!(
            canonicalize_ip("  8.8.8.8 ").unwrap().to_string(),
            "8.8.8.8"
        );
        // Compressed and uppercase v6 forms normalize to the canonical form
        assert_eq!(
            canonicalize_ip("2001:0DB8:0000:0000:0000:0000:0000:0001")
                .unwrap()
                .to_string(),
            "2001:db8::1"
        );
        assert!(canonicalize_ip("not-an-ip").is_err());
        assert!(canonicalize_ip("300.1.1.1").is_err());
    }

    #[test]
    fn test_priority_roundtrip() {
        for p in [TaskPriority::Low, TaskPriority::Normal, TaskPriority::High] {
            assert_eq!(TaskPriority::from_i16(p.as_i16()), p);
        }
        assert_eq!(TaskPriority::from_i16(-3), TaskPriority::Low);
        assert_eq!(TaskPriority::from_i16(9), TaskPriority::High);
    }

    #[test]
    fn test_source_roundtrip() {
        for s in [
            TaskSource::Static,
            TaskSource::Api,
            TaskSource::Dns,
            TaskSource::Remeasure,
        ] {
            assert_eq!(s.as_str().parse::<TaskSource>().unwrap(), s);
        }
        assert!("bogus".parse::<TaskSource>().is_err());
    }

    #[test]
    fn test_enrichable_ip() {
        assert!(is_enrichable_ip(&"1.1.1.1".parse().unwrap()));
        assert!(is_enrichable_ip(&"2001:db8::1".parse().unwrap()));
        assert!(!is_enrichable_ip(&"10.0.0.1".parse().unwrap()));
        assert!(!is_enrichable_ip(&"192.168.1.254".parse().unwrap()));
        assert!(!is_enrichable_ip(&"127.0.0.1".parse().unwrap()));
        assert!(!is_enrichable_ip(&"169.254.0.9".parse().unwrap()));
        assert!(!is_enrichable_ip(&"fe80::1".parse().unwrap()));
        assert!(!is_enrichable_ip(&"fd00::1".parse().unwrap()));
    }

    #[test]
    fn test_lookup_merge_fill() {
        let mut high = AsLookup {
            asn: None,
            org_name: Some("Google LLC".to_string()),
            country_code: None,
            prefix: None,
        };
        let low = AsLookup {
            asn: Some(15169),
            org_name: Some("GOOGLE, US".to_string()),
            country_code: Some("US".to_string()),
            prefix: Some("8.8.8.0/24".to_string()),
        };
        high.fill_missing_from(&low);
        assert_eq!(high.asn, Some(15169));
        // Higher-priority org survives the merge
        assert_eq!(high.org_name.as_deref(), Some("Google LLC"));
        assert_eq!(high.country_code.as_deref(), Some("US"));
        assert_eq!(high.prefix.as_deref(), Some("8.8.8.0/24"));
    }
}

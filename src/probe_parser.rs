// Probe output parsing - tolerant, line-based parsers for each trace tool.
//
// The contract: every hop has an integer hop number, an optional IP (absent
// means the hop timed out) and an optional RTT in milliseconds (mean of the
// samples the tool produced). Unparsable lines are skipped without aborting
// the measurement; a completely unparsable output yields zero hops.

use crate::probe_tools::TraceTool;
use crate::types::ParsedHop;
use log::warn;
use std::net::IpAddr;

pub fn parse_output(tool: TraceTool, stdout: &str) -> Vec<ParsedHop> {
    let hops = match tool {
        TraceTool::Traceroute | TraceTool::Scamper => parse_traceroute_like(stdout),
        TraceTool::Mtr => parse_mtr_report(stdout),
    };

    // Hop numbers below 1 violate the store invariant; drop them rather
    // than fail the whole measurement.
    hops.into_iter()
        .filter(|h| {
            if h.hop_number < 1 {
                warn!("⚠️ Dropping hop with invalid number {}", h.hop_number);
                false
            } else {
                true
            }
        })
        .collect()
}

/// Hops that actually answered. A probe only counts as successful when at
/// least one hop is non-timeout.
pub fn non_timeout_hop_count(hops: &[ParsedHop]) -> usize {
    hops.iter().filter(|h| h.ip.is_some()).count()
}

/// Classic traceroute report lines, shared by `traceroute -n` and scamper's
/// trace output:
///
/// ```text
///  1  192.168.1.1  0.412 ms  0.502 ms  0.601 ms
///  2  * * *
///  3  10.10.0.1  5.123 ms * 5.321 ms
/// ```
///
/// A line may carry several responder IPs when the path flaps per-probe; the
/// first one is kept. RTT samples are averaged across the line.
fn parse_traceroute_like(stdout: &str) -> Vec<ParsedHop> {
    let mut hops = Vec::new();
    for line in stdout.lines() {
        let mut tokens = line.split_whitespace().peekable();

        let Some(first) = tokens.next() else {
            continue;
        };
        // Header lines ("traceroute to ...", "traceroute from ...") and
        // anything else that does not lead with a hop number are skipped.
        let Ok(hop_number) = first.parse::<i32>() else {
            continue;
        };

        let mut ip: Option<IpAddr> = None;
        let mut samples: Vec<f64> = Vec::new();
        while let Some(token) = tokens.next() {
            if token == "*" {
                continue;
            }
            if let Ok(addr) = token.parse::<IpAddr>() {
                if ip.is_none() {
                    ip = Some(addr);
                }
                continue;
            }
            if let Ok(value) = token.parse::<f64>() {
                if tokens.peek().copied() == Some("ms") {
                    tokens.next();
                    samples.push(value);
                }
                continue;
            }
            // Annotations like !H/!N and hostnames are ignored
        }

        let rtt_ms = if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<f64>() / samples.len() as f64)
        };
        hops.push(ParsedHop {
            hop_number,
            ip,
            rtt_ms,
        });
    }
    hops
}

/// `mtr -n -r -c <count>` report format:
///
/// ```text
/// HOST: vantage          Loss%   Snt   Last   Avg  Best  Wrst StDev
///   1.|-- 192.168.1.1     0.0%     4    0.4   0.5   0.4   0.6   0.1
///   2.|-- ???           100.0%     4    0.0   0.0   0.0   0.0   0.0
/// ```
///
/// The Avg column is mtr's own mean over the samples, which is exactly the
/// RTT semantics of the hop record.
fn parse_mtr_report(stdout: &str) -> Vec<ParsedHop> {
    let mut hops = Vec::new();
    for line in stdout.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            continue;
        }

        // Hop column looks like "3.|--"
        let Some(number_text) = tokens[0].strip_suffix(".|--") else {
            continue;
        };
        let Ok(hop_number) = number_text.parse::<i32>() else {
            continue;
        };

        if tokens[1] == "???" {
            hops.push(ParsedHop {
                hop_number,
                ip: None,
                rtt_ms: None,
            });
            continue;
        }
        let Ok(ip) = tokens[1].parse::<IpAddr>() else {
            // Unexpected host column (name resolution left on), skip line
            continue;
        };

        // Columns: Loss% Snt Last Avg Best Wrst StDev
        let rtt_ms = tokens.get(5).and_then(|t| t.parse::<f64>().ok());
        hops.push(ParsedHop {
            hop_number,
            ip: Some(ip),
            rtt_ms,
        });
    }
    hops
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACEROUTE_OUTPUT: &str = "\
traceroute to 1.1.1.1 (1.1.1.1), 30 hops max, 60 byte packets
 1  192.168.1.1  0.412 ms  0.502 ms  0.601 ms
 2  * * *
 3  10.10.0.1  5.100 ms * 5.300 ms
 4  1.1.1.1  10.000 ms  9.800 ms  10.200 ms
";

    #[test]
    fn test_parse_traceroute_happy_path() {
        let hops = parse_output(TraceTool::Traceroute, TRACEROUTE_OUTPUT);
        assert_eq!(hops.len(), 4);

        assert_eq!(hops[0].hop_number, 1);
        assert_eq!(hops[0].ip.unwrap().to_string(), "192.168.1.1");
        let rtt = hops[0].rtt_ms.unwrap();
        assert!((rtt - 0.505).abs() < 1e-9, "mean of three samples, got {rtt}");

        // Timed-out hop is preserved with null IP and null RTT
        assert_eq!(hops[1].hop_number, 2);
        assert_eq!(hops[1].ip, None);
        assert_eq!(hops[1].rtt_ms, None);

        // Partial loss still averages the samples that answered
        let rtt = hops[2].rtt_ms.unwrap();
        assert!((rtt - 5.2).abs() < 1e-9);

        assert_eq!(hops[3].ip.unwrap().to_string(), "1.1.1.1");
        assert_eq!(non_timeout_hop_count(&hops), 3);
    }

    #[test]
    fn test_parse_traceroute_multiple_responders_keeps_first() {
        let output = " 5  203.0.113.1  1.200 ms 203.0.113.9  1.400 ms\n";
        let hops = parse_output(TraceTool::Traceroute, output);
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].ip.unwrap().to_string(), "203.0.113.1");
        let rtt = hops[0].rtt_ms.unwrap();
        assert!((rtt - 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_parse_traceroute_skips_garbage_lines() {
        let output = "\
no route to host
 1  192.168.1.1  0.400 ms
completely unparsable %% line
 banana
 2  * * *
";
        let hops = parse_output(TraceTool::Traceroute, output);
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].hop_number, 1);
        assert_eq!(hops[1].hop_number, 2);
    }

    #[test]
    fn test_parse_traceroute_annotations_ignored() {
        let output = " 7  198.51.100.7  3.100 ms !H  3.300 ms !H  3.200 ms !H\n";
        let hops = parse_output(TraceTool::Traceroute, output);
        assert_eq!(hops.len(), 1);
        let rtt = hops[0].rtt_ms.unwrap();
        assert!((rtt - 3.2).abs() < 1e-9);
    }

    #[test]
    fn test_parse_traceroute_empty_output() {
        assert!(parse_output(TraceTool::Traceroute, "").is_empty());
        assert!(parse_output(TraceTool::Traceroute, "traceroute to x\n").is_empty());
    }

    const SCAMPER_OUTPUT: &str = "\
traceroute from 192.0.2.10 to 1.1.1.1
 1  192.168.1.1  0.412 ms
 2  *
 3  1.1.1.1  10.123 ms
";

    #[test]
    fn test_parse_scamper_trace() {
        let hops = parse_output(TraceTool::Scamper, SCAMPER_OUTPUT);
        assert_eq!(hops.len(), 3);
        assert_eq!(hops[0].ip.unwrap().to_string(), "192.168.1.1");
        assert_eq!(hops[1].ip, None);
        assert_eq!(hops[2].hop_number, 3);
        assert!((hops[2].rtt_ms.unwrap() - 10.123).abs() < 1e-9);
    }

    const MTR_OUTPUT: &str = "\
Start: 2024-01-01T00:00:00+0000
HOST: vantage                     Loss%   Snt   Last   Avg  Best  Wrst StDev
  1.|-- 192.168.1.1                0.0%     4    0.4   0.5   0.4   0.6   0.1
  2.|-- ???                       100.0     4    0.0   0.0   0.0   0.0   0.0
  3.|-- 1.1.1.1                    0.0%     4   10.1  10.2   9.8  10.5   0.3
";

    #[test]
    fn test_parse_mtr_report() {
        let hops = parse_output(TraceTool::Mtr, MTR_OUTPUT);
        assert_eq!(hops.len(), 3);

        assert_eq!(hops[0].hop_number, 1);
        assert_eq!(hops[0].ip.unwrap().to_string(), "192.168.1.1");
        assert!((hops[0].rtt_ms.unwrap() - 0.5).abs() < 1e-9);

        assert_eq!(hops[1].ip, None);
        assert_eq!(hops[1].rtt_ms, None);

        assert!((hops[2].rtt_ms.unwrap() - 10.2).abs() < 1e-9);
        assert_eq!(non_timeout_hop_count(&hops), 2);
    }

    #[test]
    fn test_parse_mtr_ipv6() {
        let output = "  1.|-- 2001:db8::1                0.0%     4    0.4   0.5   0.4   0.6   0.1\n";
        let hops = parse_output(TraceTool::Mtr, output);
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].ip.unwrap().to_string(), "2001:db8::1");
    }

    #[test]
    fn test_invalid_hop_numbers_dropped() {
        let output = " 0  192.168.1.1  0.400 ms\n 1  192.168.1.1  0.400 ms\n";
        let hops = parse_output(TraceTool::Traceroute, output);
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].hop_number, 1);
    }
}

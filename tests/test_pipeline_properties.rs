//! Property tests for the measurement pipeline's pure stages: probe output
//! parsing, ASN sequence collapse, and edge derivation.
//!
//! Store-backed behavior lives in test_store_integration.rs.

use tracemap_node::database::HopRow;
use tracemap_node::graph_projector::{collapse_asn_sequence, edges_of};
use tracemap_node::probe_parser::{non_timeout_hop_count, parse_output};
use tracemap_node::probe_tools::TraceTool;
use tracemap_node::types::ParsedHop;

fn hop_row(measurement_id: i64, parsed: &ParsedHop, asn: Option<i64>) -> HopRow {
    HopRow {
        measurement_id,
        hop_number: parsed.hop_number,
        hop_ip: parsed.ip.map(|ip| ip.to_string()),
        rtt_ms: parsed.rtt_ms,
        asn,
    }
}

/// A timed-out hop between two resolved hops is preserved in the parse and
/// does not break the AS adjacency across it.
#[test]
fn test_timeout_hop_preserved_and_bridged() {
    let output = "\
traceroute to 1.0.0.1 (1.0.0.1), 30 hops max, 60 byte packets
 1  198.51.100.1  0.500 ms  0.600 ms  0.700 ms
 2  * * *
 3  1.0.0.1  9.900 ms  10.100 ms  10.000 ms
";
    let hops = parse_output(TraceTool::Traceroute, output);
    assert_eq!(hops.len(), 3, "all three hops persist, including the timeout");
    assert_eq!(hops[1].hop_number, 2);
    assert_eq!(hops[1].ip, None);
    assert_eq!(hops[1].rtt_ms, None);
    assert_eq!(non_timeout_hop_count(&hops), 2);

    // After enrichment the surrounding hops carry ASNs; the opaque hop in
    // between must yield a direct edge between them.
    let rows = vec![
        hop_row(7, &hops[0], Some(64500)),
        hop_row(7, &hops[1], None),
        hop_row(7, &hops[2], Some(13335)),
    ];
    let edges = edges_of(&collapse_asn_sequence(&rows));
    assert_eq!(edges.len(), 1);
    let (src, dst, rtt) = edges[0];
    assert_eq!((src, dst), (64500, 13335));
    assert!((rtt.unwrap() - 10.0).abs() < 1e-9);
}

/// Projection input is a pure function of the hops: the same rows always
/// produce the same edge set, so re-projection adds nothing new.
#[test]
fn test_edge_derivation_is_deterministic() {
    let rows = vec![
        HopRow {
            measurement_id: 1,
            hop_number: 1,
            hop_ip: Some("198.51.100.1".to_string()),
            rtt_ms: Some(1.0),
            asn: Some(64500),
        },
        HopRow {
            measurement_id: 1,
            hop_number: 2,
            hop_ip: Some("203.0.113.9".to_string()),
            rtt_ms: Some(4.0),
            asn: Some(64501),
        },
    ];
    let first = edges_of(&collapse_asn_sequence(&rows));
    let second = edges_of(&collapse_asn_sequence(&rows));
    assert_eq!(first, second);
    assert_eq!(first, vec![(64500, 64501, Some(4.0))]);
}

/// An all-timeout probe parses to hops with no IPs and produces an empty
/// AS sequence (nothing to project).
#[test]
fn test_all_timeout_probe_projects_nothing() {
    let output = " 1  * * *\n 2  * * *\n 3  * * *\n";
    let hops = parse_output(TraceTool::Traceroute, output);
    assert_eq!(hops.len(), 3);
    assert_eq!(non_timeout_hop_count(&hops), 0, "success must be false for this probe");

    let rows: Vec<HopRow> = hops.iter().map(|h| hop_row(9, h, None)).collect();
    assert!(collapse_asn_sequence(&rows).is_empty());
}

/// The mtr and traceroute parsers agree on the shape of the same path.
#[test]
fn test_tools_agree_on_path_shape() {
    let traceroute = "\
 1  198.51.100.1  0.500 ms
 2  1.0.0.1  10.000 ms
";
    let mtr = "\
HOST: vantage                     Loss%   Snt   Last   Avg  Best  Wrst StDev
  1.|-- 198.51.100.1               0.0%     4    0.5   0.5   0.4   0.6   0.1
  2.|-- 1.0.0.1                    0.0%     4   10.0  10.0   9.8  10.2   0.1
";
    let a = parse_output(TraceTool::Traceroute, traceroute);
    let b = parse_output(TraceTool::Mtr, mtr);
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.hop_number, y.hop_number);
        assert_eq!(x.ip, y.ip);
    }
}

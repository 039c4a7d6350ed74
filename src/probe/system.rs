//! System `traceroute` fallback strategy.
//!
//! Shells out to `traceroute -n -q 1` and parses the line-oriented output.
//! Any subprocess or parse failure yields an empty hop list so the caller
//! can try the next strategy.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use super::{round_rtt, Hop};

/// A hop line is either `<n> <ip> <rtt> ms` or `<n> *`.
fn hop_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\s+(?:(\d+\.\d+\.\d+\.\d+)\s+([\d.]+)\s*ms|\*)").unwrap()
    })
}

pub(crate) async fn trace_system(target: &str, max_hops: u32, timeout: Duration) -> Vec<Hop> {
    let wait_secs = timeout.as_secs().max(1);
    let overall = timeout * max_hops.max(1) + Duration::from_secs(10);

    let output = Command::new("traceroute")
        .args([
            "-n",
            "-q",
            "1",
            "-w",
            &wait_secs.to_string(),
            "-m",
            &max_hops.to_string(),
            target,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = match tokio::time::timeout(overall, output).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            tracing::debug!("traceroute spawn failed: {}", e);
            return Vec::new();
        }
        Err(_) => {
            tracing::debug!("traceroute timed out for {}", target);
            return Vec::new();
        }
    };

    parse_traceroute_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `traceroute -n -q 1` output into a contiguous hop list.
///
/// Lines that do not look like hop rows (the header, errors) are skipped;
/// hop numbers the tool skipped entirely are filled in as timeouts so the
/// result is always contiguous from 1.
fn parse_traceroute_output(output: &str) -> Vec<Hop> {
    let re = hop_line_re();
    let mut by_hop: std::collections::HashMap<u32, Hop> = std::collections::HashMap::new();
    let mut max_seen = 0u32;

    for line in output.lines() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let Ok(hop_num) = caps[1].parse::<u32>() else {
            continue;
        };
        if hop_num == 0 {
            continue;
        }
        let ip = caps.get(2).map(|m| m.as_str().to_string());
        let rtt = caps
            .get(3)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(round_rtt);

        max_seen = max_seen.max(hop_num);
        by_hop.entry(hop_num).or_insert(Hop {
            hop: hop_num,
            ip,
            dns_name: None,
            is_timeout: rtt.is_none(),
            rtt_ms: rtt,
        });
    }

    (1..=max_seen)
        .map(|n| by_hop.remove(&n).unwrap_or_else(|| Hop::timeout(n)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_traceroute_output() {
        let output = "\
traceroute to example.com (93.184.216.34), 30 hops max, 60 byte packets
 1  192.168.1.1  0.512 ms
 2  *
 3  10.11.12.13  8.91 ms
 4  93.184.216.34  15.204 ms
";
        let hops = parse_traceroute_output(output);
        assert_eq!(hops.len(), 4);
        assert_eq!(hops[0].ip.as_deref(), Some("192.168.1.1"));
        assert_eq!(hops[0].rtt_ms, Some(0.51));
        assert!(hops[1].is_timeout);
        assert!(hops[1].ip.is_none());
        assert_eq!(hops[3].ip.as_deref(), Some("93.184.216.34"));
    }

    #[test]
    fn test_parse_fills_skipped_hop_numbers() {
        let output = " 1  192.168.1.1  0.5 ms\n 3  10.0.0.3  2.0 ms\n";
        let hops = parse_traceroute_output(output);
        let numbers: Vec<u32> = hops.iter().map(|h| h.hop).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(hops[1].is_timeout);
    }

    #[test]
    fn test_parse_garbage_is_empty() {
        assert!(parse_traceroute_output("traceroute: unknown host\n").is_empty());
        assert!(parse_traceroute_output("").is_empty());
    }

    #[test]
    fn test_hop_numbers_contiguous_from_one() {
        let output = " 2  10.0.0.2  1.0 ms\n 4  10.0.0.4  2.0 ms\n";
        let hops = parse_traceroute_output(output);
        for (i, hop) in hops.iter().enumerate() {
            assert_eq!(hop.hop, i as u32 + 1);
        }
    }
}

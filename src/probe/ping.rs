//! Sequential per-hop ping strategy.
//!
//! Probes each TTL with one `ping -c 1` invocation and parses either the
//! platform's TTL-exceeded line (intermediate hop) or an echo reply (the
//! target). Works without raw-socket privileges on both macOS and Linux,
//! at the cost of one subprocess per hop.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use super::{round_rtt, Hop};

fn re_ttl_exceeded_mac() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+ bytes from ([\d.]+): Time to live exceeded").unwrap())
}

fn re_ttl_exceeded_linux() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"From ([\d.]+).*Time to live exceeded").unwrap())
}

fn re_reply_rtt() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time[=<]([\d.]+)\s*ms").unwrap())
}

fn re_reply_from() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"from ([\d.]+)").unwrap())
}

/// Result of parsing one ping invocation's output.
#[derive(Debug, PartialEq)]
struct ProbeReply {
    ip: Option<String>,
    rtt_ms: Option<f64>,
}

/// Platform-appropriate `ping` argument list for a single TTL-limited probe.
fn build_ping_args(target: &str, ttl: u32, timeout: Duration) -> Vec<String> {
    let secs = timeout.as_secs().max(1).to_string();
    if cfg!(target_os = "macos") {
        vec![
            "-c".into(),
            "1".into(),
            "-m".into(),
            ttl.to_string(),
            "-t".into(),
            secs,
            target.into(),
        ]
    } else {
        vec![
            "-c".into(),
            "1".into(),
            "-t".into(),
            ttl.to_string(),
            "-W".into(),
            secs,
            target.into(),
        ]
    }
}

/// Extract hop IP and RTT from combined ping stdout + stderr.
fn parse_ping_output(output: &str) -> ProbeReply {
    // TTL exceeded: an intermediate router answered. No usable RTT is read
    // from these lines, so the hop still counts as a timeout for loss
    // accounting even though the router's address is known.
    if let Some(caps) = re_ttl_exceeded_mac()
        .captures(output)
        .or_else(|| re_ttl_exceeded_linux().captures(output))
    {
        return ProbeReply {
            ip: Some(caps[1].to_string()),
            rtt_ms: None,
        };
    }

    // Echo reply from the target (or a same-TTL hop answering directly).
    let rtt = re_reply_rtt()
        .captures(output)
        .and_then(|c| c[1].parse::<f64>().ok());
    let from = re_reply_from().captures(output).map(|c| c[1].to_string());
    if let (Some(rtt), Some(ip)) = (rtt, from) {
        return ProbeReply {
            ip: Some(ip),
            rtt_ms: Some(round_rtt(rtt)),
        };
    }

    ProbeReply { ip: None, rtt_ms: None }
}

fn reply_to_hop(ttl: u32, reply: ProbeReply) -> Hop {
    Hop {
        hop: ttl,
        is_timeout: reply.rtt_ms.is_none(),
        ip: reply.ip,
        dns_name: None,
        rtt_ms: reply.rtt_ms,
    }
}

/// Send one ping at the given TTL and parse the result.
async fn send_probe(target: &str, ttl: u32, timeout: Duration) -> Hop {
    let args = build_ping_args(target, ttl, timeout);
    let overall = timeout + Duration::from_secs(2);

    let output = Command::new("ping")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let combined = match tokio::time::timeout(overall, output).await {
        Ok(Ok(out)) => format!(
            "{}\n{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        ),
        Ok(Err(e)) => {
            tracing::debug!("ping spawn failed at ttl {}: {}", ttl, e);
            String::new()
        }
        Err(_) => String::new(),
    };

    reply_to_hop(ttl, parse_ping_output(&combined))
}

/// Trace `host` one TTL at a time.
///
/// Stops early when a probe is answered by the resolved target address or
/// after `max_consecutive_timeouts` unanswered probes in a row.
pub(crate) async fn trace_ping(
    host: &str,
    target_ip: &str,
    max_hops: u32,
    timeout: Duration,
    inter_probe_delay: Duration,
    max_consecutive_timeouts: u32,
) -> Vec<Hop> {
    let mut hops = Vec::new();
    let mut unanswered = 0u32;

    for ttl in 1..=max_hops.max(1) {
        let hop = send_probe(host, ttl, timeout).await;
        let reached = hop.ip.as_deref() == Some(target_ip);
        let answered = hop.ip.is_some();
        hops.push(hop);

        if reached {
            break;
        }
        if answered {
            unanswered = 0;
        } else {
            unanswered += 1;
            if unanswered >= max_consecutive_timeouts.max(1) {
                break;
            }
        }
        if !inter_probe_delay.is_zero() {
            tokio::time::sleep(inter_probe_delay).await;
        }
    }

    hops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ttl_exceeded_macos() {
        let output = "36 bytes from 10.0.0.1: Time to live exceeded";
        let reply = parse_ping_output(output);
        assert_eq!(reply.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(reply.rtt_ms, None);
    }

    #[test]
    fn test_parse_ttl_exceeded_linux() {
        let output = "From 192.168.1.1 icmp_seq=1 Time to live exceeded";
        let reply = parse_ping_output(output);
        assert_eq!(reply.ip.as_deref(), Some("192.168.1.1"));
        assert_eq!(reply.rtt_ms, None);
    }

    #[test]
    fn test_parse_echo_reply() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let reply = parse_ping_output(output);
        assert_eq!(reply.ip.as_deref(), Some("8.8.8.8"));
        assert_eq!(reply.rtt_ms, Some(12.35));
    }

    #[test]
    fn test_parse_sub_millisecond_reply() {
        let output = "64 bytes from 127.0.0.1: icmp_seq=1 ttl=64 time<1 ms";
        let reply = parse_ping_output(output);
        assert_eq!(reply.rtt_ms, Some(1.0));
    }

    #[test]
    fn test_parse_no_response_is_timeout() {
        let reply = parse_ping_output("");
        assert_eq!(reply, ProbeReply { ip: None, rtt_ms: None });

        let reply = parse_ping_output("1 packets transmitted, 0 received, 100% packet loss");
        assert_eq!(reply, ProbeReply { ip: None, rtt_ms: None });
    }

    #[test]
    fn test_ttl_exceeded_hop_keeps_ip_but_counts_as_timeout() {
        let hop = reply_to_hop(
            2,
            ProbeReply {
                ip: Some("10.0.0.1".to_string()),
                rtt_ms: None,
            },
        );
        assert!(hop.is_timeout);
        assert_eq!(hop.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(hop.rtt_ms, None);
    }

    #[test]
    fn test_build_ping_args_ttl_flag() {
        let args = build_ping_args("example.com", 7, Duration::from_secs(3));
        assert!(args.contains(&"7".to_string()));
        assert_eq!(args.last().unwrap(), "example.com");
        if cfg!(target_os = "macos") {
            assert!(args.contains(&"-m".to_string()));
        } else {
            assert!(args.contains(&"-W".to_string()));
        }
    }
}

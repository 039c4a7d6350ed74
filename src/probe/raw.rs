//! Batched raw ICMP traceroute.
//!
//! Sends one echo request per TTL in a single round, then maps replies
//! back to hops by the sequence number echoed in time-exceeded and
//! echo-reply messages. The whole round shares one timeout window, so a
//! trace costs roughly `timeout` rather than a per-hop sum.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing
//! precision. Requires a RAW ICMP socket (root or CAP_NET_RAW); creation
//! failure is recoverable and yields an empty result so the caller can
//! fall back to the subprocess strategies.

use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::{round_rtt, truncate_at_target, Hop};

/// Poll granularity for the shared receive window.
const RECV_POLL: Duration = Duration::from_millis(50);

/// Run a batched trace toward `target_ip`. Returns an empty list on any
/// recoverable failure (no raw socket, IPv6 target, send failure).
pub(crate) async fn trace_raw(target_ip: IpAddr, max_hops: u32, timeout: Duration) -> Vec<Hop> {
    let v4 = match target_ip {
        IpAddr::V4(v4) => v4,
        // Time-exceeded decoding below is IPv4-only; let the chain fall
        // through for IPv6 targets.
        IpAddr::V6(_) => return Vec::new(),
    };

    let result = tokio::task::spawn_blocking(move || run_batched_round(v4, max_hops, timeout)).await;

    match result {
        Ok(hops) => hops,
        Err(e) => {
            tracing::warn!("raw probe task failed: {}", e);
            Vec::new()
        }
    }
}

fn run_batched_round(target: Ipv4Addr, max_hops: u32, timeout: Duration) -> Vec<Hop> {
    let max_hops = max_hops.max(1);

    let socket = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("raw ICMP socket unavailable: {}", e);
            return Vec::new();
        }
    };
    if socket.set_read_timeout(Some(RECV_POLL)).is_err() {
        return Vec::new();
    }

    let dest = SocketAddr::new(IpAddr::V4(target), 0);
    let identifier: u16 = rand::random();

    // Send one probe per TTL; the sequence number doubles as the TTL so
    // replies can be mapped back without tracking per-probe sockets.
    let mut sent_at: HashMap<u16, Instant> = HashMap::new();
    for ttl in 1..=max_hops {
        if socket.set_ttl(ttl).is_err() {
            continue;
        }
        let packet = build_echo_request(identifier, ttl as u16);
        match socket.send_to(&packet, &dest.into()) {
            Ok(_) => {
                sent_at.insert(ttl as u16, Instant::now());
            }
            Err(e) => {
                tracing::debug!("raw probe send failed at ttl {}: {}", ttl, e);
            }
        }
    }
    if sent_at.is_empty() {
        return Vec::new();
    }

    // One shared receive window for the whole round.
    let deadline = Instant::now() + timeout;
    let mut answered: HashMap<u16, (Ipv4Addr, f64)> = HashMap::new();
    let mut dest_ttl: Option<u16> = None;

    while Instant::now() < deadline {
        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => break,
        };
        let now = Instant::now();
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let Some((ttl_seq, from, is_dest)) = parse_reply(buf, identifier) else {
            continue;
        };
        let Some(&sent) = sent_at.get(&ttl_seq) else {
            continue;
        };
        let rtt = round_rtt(now.duration_since(sent).as_secs_f64() * 1000.0);
        answered.entry(ttl_seq).or_insert((from, rtt));
        if is_dest {
            dest_ttl.get_or_insert(ttl_seq);
        }

        // Once the destination answered and every earlier TTL is in, the
        // rest of the window cannot add anything.
        if let Some(d) = dest_ttl {
            if (1..=d).all(|t| answered.contains_key(&t)) {
                break;
            }
        }
        if answered.len() as u32 == max_hops {
            break;
        }
    }

    let hops = (1..=max_hops)
        .map(|ttl| match answered.get(&(ttl as u16)) {
            Some((ip, rtt)) => Hop {
                hop: ttl,
                ip: Some(ip.to_string()),
                dns_name: None,
                rtt_ms: Some(*rtt),
                is_timeout: false,
            },
            None => Hop::timeout(ttl),
        })
        .collect();

    truncate_at_target(hops, &target.to_string())
}

/// Decode an incoming ICMP datagram (with IPv4 header) into
/// `(probe sequence, responding address, reached destination)`.
fn parse_reply(buf: &[u8], identifier: u16) -> Option<(u16, Ipv4Addr, bool)> {
    if buf.len() < 20 || buf[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((buf[0] & 0x0f) as usize) * 4;
    let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let icmp = buf.get(ihl..)?;
    if icmp.len() < 8 {
        return None;
    }

    match icmp[0] {
        // Echo Reply: the destination itself answered.
        0 => {
            let id = u16::from_be_bytes([icmp[4], icmp[5]]);
            let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
            (id == identifier).then_some((seq, src, true))
        }
        // Time Exceeded: an intermediate router quoting our original
        // datagram (inner IPv4 header + at least 8 bytes of ICMP).
        11 => {
            let inner = icmp.get(8..)?;
            if inner.len() < 20 || inner[0] >> 4 != 4 {
                return None;
            }
            let inner_ihl = ((inner[0] & 0x0f) as usize) * 4;
            let inner_icmp = inner.get(inner_ihl..)?;
            if inner_icmp.len() < 8 || inner_icmp[0] != 8 {
                return None;
            }
            let id = u16::from_be_bytes([inner_icmp[4], inner_icmp[5]]);
            let seq = u16::from_be_bytes([inner_icmp[6], inner_icmp[7]]);
            (id == identifier).then_some((seq, src, false))
        }
        _ => None,
    }
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8; // Type: Echo Request
    packet[1] = 0; // Code: 0
    // Checksum at [2..4], computed below
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i < data.len() - 1 {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }

    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

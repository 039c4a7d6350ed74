//! Traceroute probe engine.
//!
//! Three strategies, tried in priority order: batched raw ICMP, the system
//! `traceroute` utility, and sequential per-hop `ping`. Each strategy
//! returns an empty hop list on recoverable failure so the chain can fall
//! through; only target-hostname resolution failure is a hard error.

mod ping;
mod raw;
mod system;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::dns::{DnsCache, NO_PTR};

/// Trace error types.
///
/// [`TraceError::Resolution`] means the target itself cannot be addressed
/// and is special-cased by the scheduler's DNS-failure backoff. Everything
/// else surfaces as [`TraceError::Transport`] after the strategy chain is
/// exhausted.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("failed to resolve target {0}")]
    Resolution(String),
    #[error("probe transport failed: {0}")]
    Transport(String),
}

/// One router position at a given TTL along the path to a target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hop {
    pub hop: u32,
    pub ip: Option<String>,
    pub dns_name: Option<String>,
    pub rtt_ms: Option<f64>,
    pub is_timeout: bool,
}

impl Hop {
    /// An unanswered probe at the given TTL.
    pub fn timeout(hop: u32) -> Self {
        Self {
            hop,
            ip: None,
            dns_name: None,
            rtt_ms: None,
            is_timeout: true,
        }
    }
}

/// Probe strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceMode {
    /// Try raw ICMP, then system traceroute, then per-hop ping.
    #[default]
    Auto,
    Raw,
    System,
    Ping,
}

impl TraceMode {
    /// Parse a mode name from configuration. Unknown names fall back to auto.
    pub fn parse(s: &str) -> Self {
        match s {
            "raw" => Self::Raw,
            "system" => Self::System,
            "ping" => Self::Ping,
            _ => Self::Auto,
        }
    }
}

/// Parameters for one trace run.
#[derive(Debug, Clone)]
pub struct TraceRequest {
    pub host: String,
    pub max_hops: u32,
    pub timeout: Duration,
}

/// Produces an ordered hop list for a host.
///
/// Implemented by [`SystemTracer`] in production; tests inject fakes to
/// drive the scheduler without touching the network.
#[async_trait]
pub trait Tracer: Send + Sync {
    async fn trace(&self, req: &TraceRequest) -> Result<Vec<Hop>, TraceError>;
}

/// The real multi-strategy tracer.
///
/// Hop names are left unresolved by default so callers can backfill them
/// asynchronously; [`SystemTracer::with_dns`] switches to inline
/// resolution through a shared cache.
pub struct SystemTracer {
    mode: TraceMode,
    inter_probe_delay: Duration,
    max_consecutive_timeouts: u32,
    dns: Option<Arc<DnsCache>>,
}

impl SystemTracer {
    pub fn new(mode: TraceMode, inter_probe_delay: Duration, max_consecutive_timeouts: u32) -> Self {
        Self {
            mode,
            inter_probe_delay,
            max_consecutive_timeouts,
            dns: None,
        }
    }

    /// Resolve hop names during the trace instead of deferring them.
    pub fn with_dns(mut self, dns: Arc<DnsCache>) -> Self {
        self.dns = Some(dns);
        self
    }
}

impl Default for SystemTracer {
    fn default() -> Self {
        Self::new(TraceMode::Auto, Duration::from_millis(25), 4)
    }
}

#[async_trait]
impl Tracer for SystemTracer {
    async fn trace(&self, req: &TraceRequest) -> Result<Vec<Hop>, TraceError> {
        let target_ip = resolve_target(&req.host)
            .await
            .ok_or_else(|| TraceError::Resolution(req.host.clone()))?;
        let target = target_ip.to_string();

        let strategies: &[TraceMode] = match self.mode {
            TraceMode::Auto => &[TraceMode::Raw, TraceMode::System, TraceMode::Ping],
            TraceMode::Raw => &[TraceMode::Raw],
            TraceMode::System => &[TraceMode::System],
            TraceMode::Ping => &[TraceMode::Ping],
        };

        // First strategy with a responding hop wins. A non-empty all-timeout
        // result is kept as a fallback: total loss is still a measurement.
        let mut last_resort: Vec<Hop> = Vec::new();
        for strategy in strategies {
            let hops = match strategy {
                TraceMode::Raw => raw::trace_raw(target_ip, req.max_hops, req.timeout).await,
                TraceMode::System => {
                    system::trace_system(&target, req.max_hops, req.timeout).await
                }
                TraceMode::Ping => {
                    ping::trace_ping(
                        &req.host,
                        &target,
                        req.max_hops,
                        req.timeout,
                        self.inter_probe_delay,
                        self.max_consecutive_timeouts,
                    )
                    .await
                }
                TraceMode::Auto => unreachable!(),
            };
            if hops.iter().any(|h| h.ip.is_some()) {
                return self.finish(hops).await;
            }
            if !hops.is_empty() {
                last_resort = hops;
            }
            tracing::debug!("probe strategy {:?} returned no usable rows for {}", strategy, req.host);
        }

        if last_resort.is_empty() {
            return Err(TraceError::Transport(format!(
                "all probe strategies failed for {}",
                req.host
            )));
        }
        self.finish(last_resort).await
    }
}

impl SystemTracer {
    async fn finish(&self, mut hops: Vec<Hop>) -> Result<Vec<Hop>, TraceError> {
        let Some(dns) = self.dns.clone() else {
            return Ok(hops);
        };
        // PTR lookups block; keep them off the async core.
        tokio::task::spawn_blocking(move || {
            fill_dns_names(&dns, &mut hops);
            hops
        })
        .await
        .map_err(|e| TraceError::Transport(format!("name resolution task failed: {}", e)))
    }
}

/// Fill `dns_name` for every hop with a known IP; the sentinel for absent
/// PTR records stays `None`.
fn fill_dns_names(dns: &DnsCache, hops: &mut [Hop]) {
    for hop in hops {
        if let Some(ip) = &hop.ip {
            let name = dns.resolve(ip);
            if name != NO_PTR {
                hop.dns_name = Some(name);
            }
        }
    }
}

/// Resolve the target host to an IP address, preferring IPv4.
async fn resolve_target(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }

    let addrs: Vec<IpAddr> = tokio::net::lookup_host(format!("{}:0", host))
        .await
        .ok()?
        .map(|sa| sa.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

/// Round an RTT to 2 decimal places.
pub(crate) fn round_rtt(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}

/// Truncate a hop list at the first hop whose IP is the target (inclusive).
pub(crate) fn truncate_at_target(hops: Vec<Hop>, target: &str) -> Vec<Hop> {
    let mut out = Vec::with_capacity(hops.len());
    for hop in hops {
        let reached = hop.ip.as_deref() == Some(target);
        out.push(hop);
        if reached {
            break;
        }
    }
    out
}

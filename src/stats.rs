//! Focus-window statistics for hops.
//!
//! Rolling metrics over the most recent N samples per (target, hop),
//! computed on demand and never persisted.

use serde::Serialize;

use crate::db::{DbError, Sample, Store};

/// Windowed metrics for one hop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopStats {
    pub hop: u32,
    pub ip: Option<String>,
    pub dns_name: Option<String>,
    pub avg_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub cur_ms: Option<f64>,
    pub packet_loss_pct: f64,
}

impl HopStats {
    fn empty(hop: u32) -> Self {
        Self {
            hop,
            ip: None,
            dns_name: None,
            avg_ms: None,
            min_ms: None,
            max_ms: None,
            cur_ms: None,
            packet_loss_pct: 0.0,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Compute stats from samples ordered newest first.
fn compute(hop_number: u32, rows: &[Sample]) -> HopStats {
    if rows.is_empty() {
        return HopStats::empty(hop_number);
    }

    let total = rows.len();
    let lost = rows.iter().filter(|r| r.is_timeout).count();
    let valid_rtts: Vec<f64> = rows
        .iter()
        .filter(|r| !r.is_timeout)
        .filter_map(|r| r.rtt_ms)
        .collect();

    // IP and name come from the most recent row; the current reading also
    // reflects the literal latest sample, so a fresh timeout reads as no
    // current RTT even when older samples in the window had one.
    let latest = &rows[0];
    let cur_ms = if latest.is_timeout {
        None
    } else {
        latest.rtt_ms.map(round2)
    };

    let (avg, min, max) = if valid_rtts.is_empty() {
        (None, None, None)
    } else {
        let sum: f64 = valid_rtts.iter().sum();
        let min = valid_rtts.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = valid_rtts.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        (
            Some(round2(sum / valid_rtts.len() as f64)),
            Some(round2(min)),
            Some(round2(max)),
        )
    };

    HopStats {
        hop: hop_number,
        ip: latest.ip.clone(),
        dns_name: latest.dns_name.clone(),
        avg_ms: avg,
        min_ms: min,
        max_ms: max,
        cur_ms,
        packet_loss_pct: round1(lost as f64 / total as f64 * 100.0),
    }
}

/// Stats for one hop over its most recent `focus_n` samples.
pub fn stats_for_hop(
    store: &Store,
    target_id: i64,
    hop_number: u32,
    focus_n: u32,
) -> Result<HopStats, DbError> {
    let rows = store.samples_for_hop(target_id, hop_number, focus_n)?;
    Ok(compute(hop_number, &rows))
}

/// Stats for every hop number ever observed for a target, ascending.
pub fn stats_for_all_hops(
    store: &Store,
    target_id: i64,
    focus_n: u32,
) -> Result<Vec<HopStats>, DbError> {
    store
        .distinct_hop_numbers(target_id)?
        .into_iter()
        .map(|hop| stats_for_hop(store, target_id, hop, focus_n))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Target;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::NamedTempFile;

    fn seeded_store() -> (NamedTempFile, Store, i64) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut target = Target {
            host: "example.com".to_string(),
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();
        (tmp, store, id)
    }

    fn sample(target_id: i64, offset_s: i64, hop: u32, ip: Option<&str>, rtt: Option<f64>) -> Sample {
        Sample {
            target_id,
            sampled_at: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_s),
            hop_number: hop,
            ip: ip.map(String::from),
            dns_name: None,
            rtt_ms: rtt,
            is_timeout: rtt.is_none(),
        }
    }

    #[test]
    fn test_empty_sample_set_is_all_null_zero_loss() {
        let (_tmp, store, id) = seeded_store();
        let stats = stats_for_hop(&store, id, 1, 10).unwrap();
        assert_eq!(stats.avg_ms, None);
        assert_eq!(stats.min_ms, None);
        assert_eq!(stats.max_ms, None);
        assert_eq!(stats.cur_ms, None);
        assert_eq!(stats.packet_loss_pct, 0.0);
        assert_eq!(stats.ip, None);
    }

    #[test]
    fn test_newest_timeout_nulls_cur_ms() {
        let (_tmp, store, id) = seeded_store();
        store
            .add_samples(&[
                sample(id, 0, 1, Some("10.0.0.1"), Some(10.0)),
                sample(id, 5, 1, None, None),
            ])
            .unwrap();

        let stats = stats_for_hop(&store, id, 1, 10).unwrap();
        assert_eq!(stats.packet_loss_pct, 50.0);
        assert_eq!(stats.cur_ms, None); // newest-row rule
        assert_eq!(stats.avg_ms, Some(10.0));
        assert_eq!(stats.min_ms, Some(10.0));
        assert_eq!(stats.max_ms, Some(10.0));
    }

    #[test]
    fn test_rounding_and_aggregates() {
        let (_tmp, store, id) = seeded_store();
        store
            .add_samples(&[
                sample(id, 0, 1, Some("10.0.0.1"), Some(1.111)),
                sample(id, 5, 1, Some("10.0.0.1"), Some(2.229)),
                sample(id, 10, 1, Some("10.0.0.1"), Some(3.456)),
            ])
            .unwrap();

        let stats = stats_for_hop(&store, id, 1, 10).unwrap();
        assert_eq!(stats.cur_ms, Some(3.46));
        assert_eq!(stats.min_ms, Some(1.11));
        assert_eq!(stats.max_ms, Some(3.46));
        assert_eq!(stats.avg_ms, Some(2.27)); // (1.111+2.229+3.456)/3 = 2.265…
        assert_eq!(stats.packet_loss_pct, 0.0);
    }

    #[test]
    fn test_focus_window_limits_rows() {
        let (_tmp, store, id) = seeded_store();
        // Old run lost, recent two answered: focus of 2 sees no loss.
        store
            .add_samples(&[
                sample(id, 0, 1, None, None),
                sample(id, 5, 1, Some("10.0.0.1"), Some(5.0)),
                sample(id, 10, 1, Some("10.0.0.1"), Some(7.0)),
            ])
            .unwrap();

        let stats = stats_for_hop(&store, id, 1, 2).unwrap();
        assert_eq!(stats.packet_loss_pct, 0.0);
        assert_eq!(stats.avg_ms, Some(6.0));

        let stats = stats_for_hop(&store, id, 1, 10).unwrap();
        assert_eq!(stats.packet_loss_pct, 33.3);
    }

    #[test]
    fn test_all_timeouts_keeps_latest_ip() {
        let (_tmp, store, id) = seeded_store();
        // TTL-exceeded replies carry an address but no usable RTT.
        store
            .add_samples(&[Sample {
                target_id: id,
                sampled_at: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
                hop_number: 2,
                ip: Some("10.0.0.2".to_string()),
                dns_name: None,
                rtt_ms: None,
                is_timeout: true,
            }])
            .unwrap();

        let stats = stats_for_hop(&store, id, 2, 10).unwrap();
        assert_eq!(stats.ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(stats.packet_loss_pct, 100.0);
        assert_eq!(stats.avg_ms, None);
        assert_eq!(stats.cur_ms, None);
    }

    #[test]
    fn test_all_hops_ascending() {
        let (_tmp, store, id) = seeded_store();
        store
            .add_samples(&[
                sample(id, 0, 2, Some("10.0.0.2"), Some(2.0)),
                sample(id, 0, 1, Some("10.0.0.1"), Some(1.0)),
                sample(id, 0, 3, Some("10.0.0.3"), Some(3.0)),
            ])
            .unwrap();

        let all = stats_for_all_hops(&store, id, 10).unwrap();
        let hops: Vec<u32> = all.iter().map(|s| s.hop).collect();
        assert_eq!(hops, vec![1, 2, 3]);
    }
}

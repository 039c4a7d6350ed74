//! Maintenance sweep: hourly rollups and retention.
//!
//! Raw samples older than the rollup horizon are aggregated into hourly
//! per-hop buckets, advancing window by window from the last rollup so
//! each sweep only touches new data. Raw rows and rollups past their
//! retention horizons are then deleted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;

use crate::db::{DbError, HopRollup, Sample, Store};

use super::Inner;

const ROLLUP_WINDOW_SECS: i64 = 3600;

/// Periodic loop driving one maintenance pass per tick until stopped.
pub(crate) async fn run_maintenance_loop(inner: Arc<Inner>, mut stop_rx: broadcast::Receiver<()>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(inner.cfg.maintenance_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                process_maintenance(&inner);
            }
        }
    }
}

fn process_maintenance(inner: &Inner) {
    let targets = match inner.store.get_targets() {
        Ok(targets) => targets,
        Err(e) => {
            tracing::error!("Maintenance: failed to list targets: {}", e);
            return;
        }
    };

    let now = Utc::now();
    for target in targets {
        let horizon = now - ChronoDuration::seconds(inner.cfg.rollup_horizon_secs);
        process_target_rollups(&inner.store, target.id, horizon);

        let raw_cutoff = now - ChronoDuration::seconds(inner.cfg.raw_retention_secs);
        let rollup_cutoff = now - ChronoDuration::seconds(inner.cfg.rollup_retention_secs);
        if let Err(e) = apply_retention(&inner.store, target.id, raw_cutoff, rollup_cutoff) {
            tracing::error!("Maintenance: retention failed for target {}: {}", target.id, e);
        }
    }
}

/// Roll complete hourly windows older than `cutoff` into `hop_rollups`.
///
/// Resumes from the most recent rollup bucket; with none, starts at the
/// hour of the earliest raw sample. Hours with no samples are skipped by
/// jumping to the next hour that actually has data.
pub fn process_target_rollups(store: &Store, target_id: i64, cutoff: DateTime<Utc>) {
    let mut next_start = match store.last_rollup_bucket(target_id) {
        Ok(Some(last)) => last + ChronoDuration::seconds(ROLLUP_WINDOW_SECS),
        Ok(None) => match store.earliest_sample_time(target_id) {
            Ok(Some(earliest)) => truncate_to_hour(earliest),
            Ok(None) => return,
            Err(e) => {
                tracing::error!("Rollup: earliest-sample query failed: {}", e);
                return;
            }
        },
        Err(e) => {
            tracing::error!("Rollup: last-bucket query failed: {}", e);
            return;
        }
    };

    let mut rollups = Vec::new();
    loop {
        let window_end = next_start + ChronoDuration::seconds(ROLLUP_WINDOW_SECS);
        if window_end > cutoff {
            break;
        }

        let samples = match store.samples_between(target_id, next_start, window_end) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::error!("Rollup: sample fetch failed: {}", e);
                break;
            }
        };

        if samples.is_empty() {
            // Jump the gap to the next hour with data.
            match store.next_sample_time_at_or_after(target_id, window_end) {
                Ok(Some(next)) => {
                    next_start = truncate_to_hour(next);
                    continue;
                }
                _ => break,
            }
        }

        rollups.extend(aggregate_window(target_id, next_start, &samples));
        next_start = window_end;
    }

    if rollups.is_empty() {
        return;
    }
    let count = rollups.len();
    match store.add_hop_rollups(&rollups) {
        Ok(()) => tracing::debug!("Rollup: saved {} buckets for target {}", count, target_id),
        Err(e) => tracing::error!("Rollup: batch save failed for target {}: {}", target_id, e),
    }
}

/// Aggregate one hour of samples into one rollup row per hop.
fn aggregate_window(target_id: i64, bucket: DateTime<Utc>, samples: &[Sample]) -> Vec<HopRollup> {
    struct Acc {
        count: i64,
        timeouts: i64,
        rtts: Vec<f64>,
    }

    let mut by_hop: BTreeMap<u32, Acc> = BTreeMap::new();
    for sample in samples {
        let acc = by_hop.entry(sample.hop_number).or_insert(Acc {
            count: 0,
            timeouts: 0,
            rtts: Vec::new(),
        });
        acc.count += 1;
        if sample.is_timeout {
            acc.timeouts += 1;
        } else if let Some(rtt) = sample.rtt_ms {
            acc.rtts.push(rtt);
        }
    }

    by_hop
        .into_iter()
        .map(|(hop_number, acc)| {
            let round2 = |v: f64| (v * 100.0).round() / 100.0;
            let (min_ms, avg_ms, max_ms) = if acc.rtts.is_empty() {
                (None, None, None)
            } else {
                let sum: f64 = acc.rtts.iter().sum();
                let min = acc.rtts.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = acc.rtts.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                (
                    Some(round2(min)),
                    Some(round2(sum / acc.rtts.len() as f64)),
                    Some(round2(max)),
                )
            };
            HopRollup {
                target_id,
                hop_number,
                bucket,
                sample_count: acc.count,
                timeout_count: acc.timeouts,
                min_ms,
                avg_ms,
                max_ms,
            }
        })
        .collect()
}

/// Delete raw samples and rollups past their retention cutoffs.
pub(crate) fn apply_retention(
    store: &Store,
    target_id: i64,
    raw_cutoff: DateTime<Utc>,
    rollup_cutoff: DateTime<Utc>,
) -> Result<(), DbError> {
    let raw = store.delete_samples_before(target_id, raw_cutoff)?;
    let rolled = store.delete_rollups_before(target_id, rollup_cutoff)?;
    if raw > 0 || rolled > 0 {
        tracing::debug!(
            "Retention: target {} dropped {} raw rows, {} rollups",
            target_id,
            raw,
            rolled
        );
    }
    Ok(())
}

/// Truncate a datetime to the start of its containing hour.
fn truncate_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - (ts % ROLLUP_WINDOW_SECS);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

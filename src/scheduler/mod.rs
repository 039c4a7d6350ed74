//! Scheduler module: per-target probe jobs and the cycle pipeline.
//!
//! One interval-triggered job per active target, keyed by target id.
//! Each cycle runs the probe engine, persists the hop rows, feeds the
//! route-change detector, queues DNS backfill, computes focus-window
//! statistics, evaluates alert rules, and publishes a live update — in
//! that order. A non-blocking per-target lock sheds overlapping cycles
//! instead of queueing them, and a global semaphore caps how many cycles
//! run at once across all targets.

mod enrich;
mod maintenance;

pub use maintenance::process_target_rollups;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::MissedTickBehavior;

use crate::alerts::{ActionDispatcher, AlertEvaluator};
use crate::config::Config;
use crate::db::{RouteChange, Sample, Store, Target};
use crate::dns::DnsCache;
use crate::probe::{Hop, TraceError, TraceRequest, Tracer};
use crate::route::RouteDetector;
use crate::stats::{stats_for_all_hops, HopStats};

use enrich::BackfillQueue;

/// Per-target summary: target metadata plus final-hop statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub target_id: i64,
    pub host: String,
    pub label: Option<String>,
    pub active: bool,
    pub avg_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub cur_ms: Option<f64>,
    pub packet_loss_pct: f64,
}

impl SummaryRow {
    fn build(job: &JobSpec, hop_stats: &[HopStats]) -> Self {
        let last = hop_stats.last();
        Self {
            target_id: job.target_id,
            host: job.host.clone(),
            label: job.label.clone(),
            active: true,
            avg_ms: last.and_then(|s| s.avg_ms),
            min_ms: last.and_then(|s| s.min_ms),
            max_ms: last.and_then(|s| s.max_ms),
            cur_ms: last.and_then(|s| s.cur_ms),
            packet_loss_pct: last.map_or(0.0, |s| s.packet_loss_pct),
        }
    }
}

/// Event pushed to live-update subscribers once per completed cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    SampleResult {
        target_id: i64,
        sampled_at: DateTime<Utc>,
        hops: Vec<Hop>,
        hop_stats: Vec<HopStats>,
        #[serde(skip_serializing_if = "Option::is_none")]
        route_change: Option<RouteChange>,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary_row: Option<SummaryRow>,
    },
    SummaryUpdate {
        target_id: i64,
        summary_row: SummaryRow,
        sampled_at: DateTime<Utc>,
    },
}

/// What a single cycle invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    Completed,
    /// A prior cycle for the target was still in flight.
    Skipped,
    Failed,
    /// The target hit the DNS-failure threshold and was unscheduled.
    Deactivated,
}

/// Everything a target's job needs, captured at registration time.
#[derive(Debug, Clone)]
pub(crate) struct JobSpec {
    pub(crate) target_id: i64,
    pub(crate) host: String,
    pub(crate) label: Option<String>,
    pub(crate) interval_seconds: f64,
    pub(crate) max_hops: u32,
    pub(crate) timeout_seconds: f64,
}

impl JobSpec {
    fn from_target(target: &Target) -> Self {
        Self {
            target_id: target.id,
            host: target.host.clone(),
            label: target.label.clone(),
            interval_seconds: if target.interval_seconds > 0.0 {
                target.interval_seconds
            } else {
                2.5
            },
            max_hops: target.max_hops.max(1),
            timeout_seconds: if target.timeout_seconds > 0.0 {
                target.timeout_seconds
            } else {
                3.0
            },
        }
    }
}

/// Latest completed cycle per target, for low-latency reads.
struct CycleSnapshot {
    sampled_at: DateTime<Utc>,
    hops: Vec<Hop>,
    hop_stats: Vec<HopStats>,
    summary_row: SummaryRow,
}

/// Shared scheduler state. All per-target mutable maps live here, owned by
/// the scheduler instance rather than as globals.
pub(crate) struct Inner {
    pub(crate) cfg: Config,
    pub(crate) store: Store,
    pub(crate) dns: Arc<DnsCache>,
    pub(crate) backfill: BackfillQueue,
    tracer: Arc<dyn Tracer>,
    evaluator: AlertEvaluator,
    routes: RouteDetector,
    workers: Arc<Semaphore>,
    jobs: Mutex<HashMap<i64, broadcast::Sender<()>>>,
    cycle_locks: Mutex<HashMap<i64, Arc<Semaphore>>>,
    dns_failures: Mutex<HashMap<i64, u32>>,
    latest: RwLock<HashMap<i64, CycleSnapshot>>,
    subscribers: Mutex<HashMap<i64, Vec<mpsc::Sender<LiveEvent>>>>,
    summary_subscribers: Mutex<Vec<mpsc::Sender<LiveEvent>>>,
    sweeps_stop: broadcast::Sender<()>,
}

impl Inner {
    /// The per-target exclusivity lock, created on first use.
    fn cycle_lock(&self, target_id: i64) -> Arc<Semaphore> {
        self.cycle_locks
            .lock()
            .unwrap()
            .entry(target_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    fn note_dns_failure(&self, target_id: i64) -> u32 {
        let mut failures = self.dns_failures.lock().unwrap();
        let count = failures.entry(target_id).or_insert(0);
        *count += 1;
        *count
    }

    fn reset_dns_failures(&self, target_id: i64) {
        self.dns_failures.lock().unwrap().remove(&target_id);
    }

    /// Remove a target's job and purge all its in-memory state. An
    /// execution already in flight runs to completion; it may briefly
    /// repopulate the caches, which the next deregistration or restart
    /// clears (accepted race).
    fn deregister(&self, target_id: i64) {
        if let Some(stop) = self.jobs.lock().unwrap().remove(&target_id) {
            let _ = stop.send(());
            tracing::info!("Scheduler: removed job for target {}", target_id);
        }
        self.latest.write().unwrap().remove(&target_id);
        self.dns_failures.lock().unwrap().remove(&target_id);
        self.cycle_locks.lock().unwrap().remove(&target_id);
        self.routes.forget(target_id);
        self.subscribers.lock().unwrap().remove(&target_id);
    }

    fn publish(&self, target_id: i64, event: &LiveEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(&target_id) {
            retain_live(list, event);
            if list.is_empty() {
                subs.remove(&target_id);
            }
        }
    }

    fn publish_summary(&self, event: &LiveEvent) {
        let mut subs = self.summary_subscribers.lock().unwrap();
        retain_live(&mut subs, event);
    }
}

/// Deliver to every open channel; a full channel drops this event for that
/// subscriber, a closed one is removed.
fn retain_live(list: &mut Vec<mpsc::Sender<LiveEvent>>, event: &LiveEvent) {
    list.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// The main scheduler that orchestrates probe execution.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        cfg: Config,
        store: Store,
        tracer: Arc<dyn Tracer>,
        dns: Arc<DnsCache>,
        dispatcher: Arc<dyn ActionDispatcher>,
    ) -> Self {
        let (sweeps_stop, _) = broadcast::channel(1);
        let workers = Arc::new(Semaphore::new(cfg.worker_cap.max(1)));
        Self {
            inner: Arc::new(Inner {
                cfg,
                store,
                dns,
                backfill: BackfillQueue::new(),
                tracer,
                evaluator: AlertEvaluator::new(dispatcher),
                routes: RouteDetector::new(),
                workers,
                jobs: Mutex::new(HashMap::new()),
                cycle_locks: Mutex::new(HashMap::new()),
                dns_failures: Mutex::new(HashMap::new()),
                latest: RwLock::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                summary_subscribers: Mutex::new(Vec::new()),
                sweeps_stop,
            }),
        }
    }

    /// Resume monitoring for every active target and start the global
    /// enrichment and maintenance sweeps.
    pub async fn start(&self) -> Result<(), crate::db::DbError> {
        let targets = self.inner.store.get_active_targets()?;
        tracing::info!("Starting scheduler with {} active targets", targets.len());
        for target in &targets {
            self.start_monitoring(target);
        }

        tokio::spawn(enrich::run_enrichment_loop(
            self.inner.clone(),
            self.inner.sweeps_stop.subscribe(),
        ));
        tokio::spawn(maintenance::run_maintenance_loop(
            self.inner.clone(),
            self.inner.sweeps_stop.subscribe(),
        ));

        Ok(())
    }

    /// Register (or replace) the recurring trace job for a target.
    pub fn start_monitoring(&self, target: &Target) {
        let job = JobSpec::from_target(target);
        let (stop_tx, stop_rx) = broadcast::channel(1);

        {
            let mut jobs = self.inner.jobs.lock().unwrap();
            if let Some(old) = jobs.insert(job.target_id, stop_tx) {
                let _ = old.send(());
            }
        }

        tracing::info!(
            "Started monitoring target {} ({}) every {:.1}s",
            job.target_id,
            job.host,
            job.interval_seconds
        );
        tokio::spawn(run_job_loop(self.inner.clone(), job, stop_rx));
    }

    /// Remove the trace job for a target. No-op if none exists.
    pub fn stop_monitoring(&self, target_id: i64) {
        self.inner.deregister(target_id);
    }

    /// Latest raw hop list from the in-memory cache.
    pub fn latest_hops(&self, target_id: i64) -> Option<Vec<Hop>> {
        self.inner
            .latest
            .read()
            .unwrap()
            .get(&target_id)
            .map(|snap| snap.hops.clone())
    }

    /// Latest computed hop statistics from the in-memory cache.
    pub fn latest_stats(&self, target_id: i64) -> Option<Vec<HopStats>> {
        self.inner
            .latest
            .read()
            .unwrap()
            .get(&target_id)
            .map(|snap| snap.hop_stats.clone())
    }

    /// Subscribe to one target's live updates. The most recent cached
    /// result, if any, is delivered immediately.
    pub fn subscribe(&self, target_id: i64) -> mpsc::Receiver<LiveEvent> {
        let (tx, rx) = mpsc::channel(32);
        if let Some(snap) = self.inner.latest.read().unwrap().get(&target_id) {
            let _ = tx.try_send(snapshot_event(target_id, snap, None));
        }
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .entry(target_id)
            .or_default()
            .push(tx);
        rx
    }

    /// Subscribe to summary deltas across all targets.
    pub fn subscribe_summary(&self) -> mpsc::Receiver<LiveEvent> {
        let (tx, rx) = mpsc::channel(32);
        self.inner.summary_subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Reverse-DNS cache statistics, for operational tooling.
    pub fn dns_cache_stats(&self) -> crate::dns::CacheStats {
        self.inner.dns.stats()
    }

    /// Stop all jobs and the global sweeps.
    pub fn shutdown(&self) {
        let _ = self.inner.sweeps_stop.send(());
        let jobs: Vec<i64> = self.inner.jobs.lock().unwrap().keys().copied().collect();
        for target_id in jobs {
            self.inner.deregister(target_id);
        }
        tracing::info!("Scheduler stopped");
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> Arc<Inner> {
        self.inner.clone()
    }
}

fn snapshot_event(target_id: i64, snap: &CycleSnapshot, route_change: Option<RouteChange>) -> LiveEvent {
    LiveEvent::SampleResult {
        target_id,
        sampled_at: snap.sampled_at,
        hops: snap.hops.clone(),
        hop_stats: snap.hop_stats.clone(),
        route_change,
        summary_row: Some(snap.summary_row.clone()),
    }
}

/// Run the interval loop for a single target's job.
async fn run_job_loop(inner: Arc<Inner>, job: JobSpec, mut stop_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_secs_f64(job.interval_seconds.max(0.5)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                // Cycles run off the dispatch loop so a slow trace cannot
                // delay this target's ticks; the per-target lock inside
                // run_cycle sheds the overlap instead.
                let inner = inner.clone();
                let job = job.clone();
                tokio::spawn(async move {
                    run_cycle(inner, job).await;
                });
            }
        }
    }
}

/// One probe-and-publish cycle for one target.
pub(crate) async fn run_cycle(inner: Arc<Inner>, job: JobSpec) -> CycleOutcome {
    let target_id = job.target_id;

    // Non-blocking exclusivity: a cycle still in flight means this one is
    // shed entirely, never queued. The owned permit releases on every exit
    // path when it drops.
    let lock = inner.cycle_lock(target_id);
    let _cycle_permit = match lock.try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            tracing::debug!("Skipping cycle for target {}: previous still running", target_id);
            return CycleOutcome::Skipped;
        }
    };

    // Bound total concurrent cycles across targets.
    let _worker_permit = match inner.workers.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return CycleOutcome::Failed,
    };

    let req = TraceRequest {
        host: job.host.clone(),
        max_hops: job.max_hops,
        timeout: Duration::from_secs_f64(job.timeout_seconds),
    };

    let hops = match inner.tracer.trace(&req).await {
        Ok(hops) => hops,
        Err(TraceError::Resolution(host)) => {
            let failures = inner.note_dns_failure(target_id);
            if failures >= inner.cfg.dns_failure_threshold {
                tracing::warn!(
                    "Target {} ({}): {} consecutive resolution failures, deactivating",
                    target_id,
                    host,
                    failures
                );
                if let Err(e) = inner.store.set_target_active(target_id, false) {
                    tracing::error!("Failed to deactivate target {}: {}", target_id, e);
                }
                inner.deregister(target_id);
                return CycleOutcome::Deactivated;
            }
            tracing::warn!(
                "Target {} ({}): resolution failure {}/{}",
                target_id,
                host,
                failures,
                inner.cfg.dns_failure_threshold
            );
            return CycleOutcome::Failed;
        }
        Err(e) => {
            tracing::error!("Trace failed for target {} ({}): {}", target_id, job.host, e);
            return CycleOutcome::Failed;
        }
    };
    inner.reset_dns_failures(target_id);

    let sampled_at = Utc::now();
    let samples: Vec<Sample> = hops
        .iter()
        .map(|h| Sample {
            target_id,
            sampled_at,
            hop_number: h.hop,
            ip: h.ip.clone(),
            dns_name: h.dns_name.clone(),
            rtt_ms: h.rtt_ms,
            is_timeout: h.is_timeout,
        })
        .collect();

    // Everything after this point depends on committed state; a failed
    // write aborts the rest of the cycle.
    if let Err(e) = inner.store.add_samples(&samples) {
        tracing::error!("Failed to persist samples for target {}: {}", target_id, e);
        return CycleOutcome::Failed;
    }

    let new_route = hops.iter().map(|h| h.ip.clone()).collect();
    let route_change = match inner.routes.observe(&inner.store, target_id, new_route, sampled_at) {
        Ok(change) => change,
        Err(e) => {
            tracing::error!("Route detection failed for target {}: {}", target_id, e);
            None
        }
    };

    // Queue unresolved hop IPs for the enrichment sweep; never blocks.
    for hop in &hops {
        if let (Some(ip), None) = (&hop.ip, &hop.dns_name) {
            inner.backfill.enqueue(ip);
        }
    }

    let hop_stats = match stats_for_all_hops(&inner.store, target_id, inner.cfg.focus_samples) {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!("Stats computation failed for target {}: {}", target_id, e);
            return CycleOutcome::Failed;
        }
    };

    let summary_row = SummaryRow::build(&job, &hop_stats);
    {
        let mut latest = inner.latest.write().unwrap();
        latest.insert(
            target_id,
            CycleSnapshot {
                sampled_at,
                hops: hops.clone(),
                hop_stats: hop_stats.clone(),
                summary_row: summary_row.clone(),
            },
        );
    }

    // Alert evaluation reuses the statistics computed above; a store error
    // here must not keep the update from reaching subscribers.
    if let Err(e) = inner
        .evaluator
        .evaluate_target(&inner.store, target_id, &hop_stats, sampled_at)
        .await
    {
        tracing::error!("Alert evaluation failed for target {}: {}", target_id, e);
    }

    inner.publish(
        target_id,
        &LiveEvent::SampleResult {
            target_id,
            sampled_at,
            hops,
            hop_stats,
            route_change,
            summary_row: Some(summary_row.clone()),
        },
    );
    inner.publish_summary(&LiveEvent::SummaryUpdate {
        target_id,
        summary_row,
        sampled_at,
    });

    CycleOutcome::Completed
}

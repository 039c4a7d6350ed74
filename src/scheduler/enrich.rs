//! DNS enrichment sweep.
//!
//! Probe cycles persist hops with unresolved names and queue the IPs here.
//! A periodic task drains the queue in bounded batches, resolves PTR
//! records through the shared cache, and backfills the names onto the
//! persisted rows that are still missing one.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::dns::NO_PTR;

use super::Inner;

/// Deduplicated FIFO of hop IPs awaiting reverse-DNS backfill.
pub(crate) struct BackfillQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    queued: HashSet<String>,
}

impl BackfillQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Queue an IP unless it is already waiting.
    pub(crate) fn enqueue(&self, ip: &str) {
        if ip.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.queued.insert(ip.to_string()) {
            state.order.push_back(ip.to_string());
        }
    }

    /// Pop up to `n` IPs in arrival order.
    pub(crate) fn drain(&self, n: usize) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        let take = n.min(state.order.len());
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(ip) = state.order.pop_front() {
                state.queued.remove(&ip);
                out.push(ip);
            }
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().order.len()
    }
}

/// Periodic loop driving [`sweep_once`] until stopped.
pub(crate) async fn run_enrichment_loop(inner: Arc<Inner>, mut stop_rx: broadcast::Receiver<()>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(inner.cfg.enrich_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                sweep_once(&inner).await;
            }
        }
    }
}

/// Drain one batch of queued IPs, resolve them, and backfill sample rows.
///
/// PTR lookups block, so they run off the async core. Sentinel results are
/// cached by the DNS layer but never written into sample rows.
pub(crate) async fn sweep_once(inner: &Inner) {
    let batch = inner.backfill.drain(inner.cfg.enrich_batch.max(1));
    if batch.is_empty() {
        return;
    }
    tracing::debug!(
        "Enrichment sweep: resolving {} queued IPs ({} still waiting)",
        batch.len(),
        inner.backfill.len()
    );

    for ip in batch {
        let dns = inner.dns.clone();
        let lookup_ip = ip.clone();
        let name = tokio::task::spawn_blocking(move || dns.resolve(&lookup_ip))
            .await
            .unwrap_or_else(|_| NO_PTR.to_string());

        if name == NO_PTR {
            continue;
        }
        match inner
            .store
            .backfill_dns_name(&ip, &name, inner.cfg.enrich_update_limit)
        {
            Ok(updated) if updated > 0 => {
                tracing::debug!("Backfilled {} rows for {} -> {}", updated, ip, name);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("DNS backfill failed for {}: {}", ip, e);
            }
        }
    }
}

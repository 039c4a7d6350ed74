//! Alert condition evaluator and state machine.
//!
//! Each rule has a metric, operator, threshold, and `duration_samples`
//! that together define when it fires. Evaluation runs once per target per
//! probing cycle against that cycle's precomputed hop statistics, tracking
//! consecutive breaches and dispatching the configured action through the
//! [`ActionDispatcher`] boundary.

mod actions;

pub use actions::*;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::{AlertEvent, AlertRule, DbError, Store};
use crate::stats::HopStats;

/// The statistic a rule evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    PacketLossPct,
    AvgRttMs,
    CurRttMs,
}

impl Metric {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "packet_loss_pct" => Some(Self::PacketLossPct),
            "avg_rtt_ms" => Some(Self::AvgRttMs),
            "cur_rtt_ms" => Some(Self::CurRttMs),
            _ => None,
        }
    }

    fn extract(self, stats: &HopStats) -> Option<f64> {
        match self {
            Self::PacketLossPct => Some(stats.packet_loss_pct),
            Self::AvgRttMs => stats.avg_ms,
            Self::CurRttMs => stats.cur_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Gt,
    Lt,
    Ge,
    Le,
}

impl Op {
    fn parse(s: &str) -> Option<Self> {
        match s {
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }

    fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Ge => value >= threshold,
            Self::Le => value <= threshold,
        }
    }
}

/// Which hop rows a rule applies to.
enum HopSelector {
    Any,
    Final,
    Ip(String),
}

impl HopSelector {
    fn parse(s: &str) -> Self {
        match s {
            "any" => Self::Any,
            "final" => Self::Final,
            ip => Self::Ip(ip.to_string()),
        }
    }

    fn select<'a>(&self, all_stats: &'a [HopStats]) -> Vec<&'a HopStats> {
        match self {
            Self::Any => all_stats.iter().collect(),
            Self::Final => all_stats.last().into_iter().collect(),
            Self::Ip(ip) => all_stats
                .iter()
                .filter(|s| s.ip.as_deref() == Some(ip.as_str()))
                .collect(),
        }
    }
}

/// Evaluate whether a rule's condition is currently breached.
///
/// Returns `(triggered, observed value)`. An unknown operator or metric
/// never triggers and is warned once per evaluation; a selector matching
/// no hops is not-triggered with a null observed value.
fn check_condition(rule: &AlertRule, all_stats: &[HopStats]) -> (bool, Option<f64>) {
    let Some(op) = Op::parse(&rule.operator) else {
        tracing::warn!("Unknown operator {:?} on alert {}", rule.operator, rule.id);
        return (false, None);
    };
    let Some(metric) = Metric::parse(&rule.metric) else {
        tracing::warn!("Unknown metric {:?} on alert {}", rule.metric, rule.id);
        return (false, None);
    };

    let hops = HopSelector::parse(&rule.hop_selector).select(all_stats);
    for stats in &hops {
        if let Some(value) = metric.extract(stats) {
            if op.apply(value, rule.threshold) {
                return (true, Some(value));
            }
        }
    }

    // Report the first matching hop's reading for logging.
    let value = hops.first().and_then(|s| metric.extract(s));
    (false, value)
}

/// Stateful threshold rule engine. Owns the dispatch boundary; all rule
/// state lives in the store.
pub struct AlertEvaluator {
    dispatcher: Arc<dyn ActionDispatcher>,
}

impl AlertEvaluator {
    pub fn new(dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run every enabled rule for a target against the cycle's statistics.
    pub async fn evaluate_target(
        &self,
        store: &Store,
        target_id: i64,
        all_stats: &[HopStats],
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let rules = store.enabled_alerts(target_id)?;
        for rule in rules {
            let (triggered, value) = check_condition(&rule, all_stats);
            self.apply_transition(store, &rule, triggered, value, now)
                .await?;
        }
        Ok(())
    }

    async fn apply_transition(
        &self,
        store: &Store,
        rule: &AlertRule,
        triggered: bool,
        metric_value: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        if triggered {
            let consecutive = rule.consecutive_triggers + 1;
            if consecutive >= rule.duration_samples {
                // The counter keeps climbing while the breach is sustained,
                // so every further breaching cycle re-fires.
                self.fire(store, rule, consecutive, metric_value, now).await?;
            } else {
                store.update_alert_state(rule.id, consecutive, rule.last_triggered_at)?;
            }
        } else {
            if rule.consecutive_triggers >= rule.duration_samples {
                tracing::info!(
                    "Alert {} recovered (was active for {} samples)",
                    rule.id,
                    rule.consecutive_triggers
                );
            }
            if rule.consecutive_triggers != 0 {
                store.update_alert_state(rule.id, 0, rule.last_triggered_at)?;
            }
        }
        Ok(())
    }

    async fn fire(
        &self,
        store: &Store,
        rule: &AlertRule,
        consecutive: u32,
        metric_value: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let message = format!(
            "Alert {}: {} {} {} (value={}) on target {}, hop={}",
            rule.id,
            rule.metric,
            rule.operator,
            rule.threshold,
            metric_value.map_or_else(|| "none".to_string(), |v| v.to_string()),
            rule.target_id,
            rule.hop_selector,
        );
        tracing::warn!("{}", message);

        match ActionConfig::decode(&rule.action_type, rule.action_config.as_deref()) {
            Some(action) => self.dispatcher.dispatch(&action, &message).await,
            None => tracing::warn!(
                "Alert {}: undecodable action {:?}, event recorded without dispatch",
                rule.id,
                rule.action_type
            ),
        }

        store.add_alert_event(&AlertEvent {
            alert_id: rule.id,
            target_id: rule.target_id,
            triggered_at: now,
            metric_value,
            message,
        })?;
        store.update_alert_state(rule.id, consecutive, Some(now))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Target;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct RecordingDispatcher {
        calls: Mutex<Vec<(String, String)>>,
    }

    impl RecordingDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ActionDispatcher for RecordingDispatcher {
        async fn dispatch(&self, action: &ActionConfig, message: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((action.type_name().to_string(), message.to_string()));
        }
    }

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

    fn hop_stats(hop: u32, ip: &str, loss: f64, avg: Option<f64>, cur: Option<f64>) -> HopStats {
        HopStats {
            hop,
            ip: Some(ip.to_string()),
            dns_name: None,
            avg_ms: avg,
            min_ms: avg,
            max_ms: avg,
            cur_ms: cur,
            packet_loss_pct: loss,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_fires_each_breaching_cycle_with_configured_action() {
        let (_tmp, store, tid) = seeded_store();
        let mut rule = AlertRule {
            target_id: tid,
            metric: "packet_loss_pct".to_string(),
            operator: ">".to_string(),
            threshold: 5.0,
            duration_samples: 1,
            hop_selector: "final".to_string(),
            action_type: "log".to_string(),
            ..Default::default()
        };
        store.add_alert(&mut rule).unwrap();

        let dispatcher = RecordingDispatcher::new();
        let evaluator = AlertEvaluator::new(dispatcher.clone());
        let stats = vec![hop_stats(1, "10.0.0.1", 50.0, Some(1.0), Some(1.0))];

        evaluator.evaluate_target(&store, tid, &stats, now()).await.unwrap();
        evaluator.evaluate_target(&store, tid, &stats, now()).await.unwrap();

        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 2); // one firing per breaching cycle
        assert_eq!(calls[0].0, "log");
        assert!(calls[0].1.contains("packet_loss_pct > 5"));
        assert!(calls[0].1.contains("value=50"));
        assert!(calls[0].1.contains(&format!("target {}", tid)));

        let fetched = store.get_alert(rule.id).unwrap();
        assert_eq!(fetched.consecutive_triggers, 2);
        assert!(fetched.last_triggered_at.is_some());
        assert_eq!(store.alert_events(tid).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_operator_never_fires() {
        let (_tmp, store, tid) = seeded_store();
        let mut rule = AlertRule {
            target_id: tid,
            metric: "packet_loss_pct".to_string(),
            operator: "!=".to_string(),
            threshold: 0.0,
            duration_samples: 1,
            hop_selector: "any".to_string(),
            ..Default::default()
        };
        store.add_alert(&mut rule).unwrap();

        let dispatcher = RecordingDispatcher::new();
        let evaluator = AlertEvaluator::new(dispatcher.clone());
        let stats = vec![hop_stats(1, "10.0.0.1", 100.0, None, None)];

        evaluator.evaluate_target(&store, tid, &stats, now()).await.unwrap();
        assert!(dispatcher.calls().is_empty());
        assert_eq!(store.get_alert(rule.id).unwrap().consecutive_triggers, 0);
    }

    #[tokio::test]
    async fn test_duration_samples_requires_sustained_breach() {
        let (_tmp, store, tid) = seeded_store();
        let mut rule = AlertRule {
            target_id: tid,
            metric: "avg_rtt_ms".to_string(),
            operator: ">=".to_string(),
            threshold: 100.0,
            duration_samples: 3,
            hop_selector: "final".to_string(),
            ..Default::default()
        };
        store.add_alert(&mut rule).unwrap();

        let dispatcher = RecordingDispatcher::new();
        let evaluator = AlertEvaluator::new(dispatcher.clone());
        let breach = vec![hop_stats(1, "10.0.0.1", 0.0, Some(150.0), Some(150.0))];

        evaluator.evaluate_target(&store, tid, &breach, now()).await.unwrap();
        evaluator.evaluate_target(&store, tid, &breach, now()).await.unwrap();
        assert!(dispatcher.calls().is_empty());

        evaluator.evaluate_target(&store, tid, &breach, now()).await.unwrap();
        assert_eq!(dispatcher.calls().len(), 1);

        // Counter is not reset by firing: the next breach re-fires at 4.
        evaluator.evaluate_target(&store, tid, &breach, now()).await.unwrap();
        assert_eq!(dispatcher.calls().len(), 2);
        assert_eq!(store.get_alert(rule.id).unwrap().consecutive_triggers, 4);
    }

    #[tokio::test]
    async fn test_recovery_resets_counter_without_firing() {
        let (_tmp, store, tid) = seeded_store();
        let mut rule = AlertRule {
            target_id: tid,
            metric: "packet_loss_pct".to_string(),
            operator: ">".to_string(),
            threshold: 5.0,
            duration_samples: 1,
            hop_selector: "final".to_string(),
            ..Default::default()
        };
        store.add_alert(&mut rule).unwrap();

        let dispatcher = RecordingDispatcher::new();
        let evaluator = AlertEvaluator::new(dispatcher.clone());

        let breach = vec![hop_stats(1, "10.0.0.1", 50.0, Some(1.0), Some(1.0))];
        let clear = vec![hop_stats(1, "10.0.0.1", 0.0, Some(1.0), Some(1.0))];

        evaluator.evaluate_target(&store, tid, &breach, now()).await.unwrap();
        assert_eq!(dispatcher.calls().len(), 1);

        evaluator.evaluate_target(&store, tid, &clear, now()).await.unwrap();
        assert_eq!(dispatcher.calls().len(), 1); // no fire on recovery
        assert_eq!(store.get_alert(rule.id).unwrap().consecutive_triggers, 0);
    }

    #[tokio::test]
    async fn test_hop_selectors() {
        let (_tmp, store, tid) = seeded_store();
        let stats = vec![
            hop_stats(1, "10.0.0.1", 80.0, Some(1.0), Some(1.0)),
            hop_stats(2, "10.0.0.2", 0.0, Some(2.0), Some(2.0)),
        ];

        // `final` sees only hop 2 (no breach there).
        let mut final_rule = AlertRule {
            target_id: tid,
            metric: "packet_loss_pct".to_string(),
            operator: ">".to_string(),
            threshold: 50.0,
            hop_selector: "final".to_string(),
            ..Default::default()
        };
        store.add_alert(&mut final_rule).unwrap();

        let dispatcher = RecordingDispatcher::new();
        let evaluator = AlertEvaluator::new(dispatcher.clone());
        evaluator.evaluate_target(&store, tid, &stats, now()).await.unwrap();
        assert!(dispatcher.calls().is_empty());

        // `any` matches the breaching hop 1; an IP literal matches its row.
        assert!(check_condition(
            &AlertRule {
                hop_selector: "any".to_string(),
                operator: ">".to_string(),
                metric: "packet_loss_pct".to_string(),
                threshold: 50.0,
                ..Default::default()
            },
            &stats
        )
        .0);
        let (triggered, value) = check_condition(
            &AlertRule {
                hop_selector: "10.0.0.2".to_string(),
                operator: ">=".to_string(),
                metric: "avg_rtt_ms".to_string(),
                threshold: 2.0,
                ..Default::default()
            },
            &stats,
        );
        assert!(triggered);
        assert_eq!(value, Some(2.0));
    }

    #[tokio::test]
    async fn test_no_matching_hops_is_not_triggered() {
        let (_tmp, store, tid) = seeded_store();
        let mut rule = AlertRule {
            target_id: tid,
            metric: "packet_loss_pct".to_string(),
            operator: ">".to_string(),
            threshold: 0.0,
            duration_samples: 1,
            hop_selector: "192.0.2.1".to_string(),
            ..Default::default()
        };
        store.add_alert(&mut rule).unwrap();
        store.update_alert_state(rule.id, 2, None).unwrap(); // previously alerting

        let dispatcher = RecordingDispatcher::new();
        let evaluator = AlertEvaluator::new(dispatcher.clone());
        let stats = vec![hop_stats(1, "10.0.0.1", 100.0, None, None)];

        evaluator.evaluate_target(&store, tid, &stats, now()).await.unwrap();
        assert!(dispatcher.calls().is_empty());
        // Evolves per the not-triggered rule: recovery + reset.
        assert_eq!(store.get_alert(rule.id).unwrap().consecutive_triggers, 0);
    }

    #[test]
    fn test_check_condition_null_metric_never_triggers() {
        // cur_rtt_ms on a hop whose newest sample timed out is null.
        let stats = vec![hop_stats(1, "10.0.0.1", 50.0, Some(10.0), None)];
        let rule = AlertRule {
            metric: "cur_rtt_ms".to_string(),
            operator: ">".to_string(),
            threshold: 0.0,
            hop_selector: "any".to_string(),
            ..Default::default()
        };
        let (triggered, value) = check_condition(&rule, &stats);
        assert!(!triggered);
        assert_eq!(value, None);
    }
}

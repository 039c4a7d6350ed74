//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A host under continuous monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub host: String,
    pub label: Option<String>,
    pub interval_seconds: f64,
    pub max_hops: u32,
    pub timeout_seconds: f64,
    pub active: bool,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            host: String::new(),
            label: None,
            interval_seconds: 2.5,
            max_hops: 30,
            timeout_seconds: 3.0,
            active: true,
        }
    }
}

/// One hop's measurement within one trace run.
///
/// Every run inserts one row per hop, all sharing `sampled_at`. Timed-out
/// hops have `rtt_ms` NULL and `is_timeout` set; the hop may still carry an
/// `ip` when an intermediate router answered but no usable RTT was read.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub target_id: i64,
    pub sampled_at: DateTime<Utc>,
    pub hop_number: u32,
    pub ip: Option<String>,
    pub dns_name: Option<String>,
    pub rtt_ms: Option<f64>,
    pub is_timeout: bool,
}

/// A detected change in the hop-IP sequence to a target.
#[derive(Debug, Clone, Serialize)]
pub struct RouteChange {
    pub target_id: i64,
    pub detected_at: DateTime<Utc>,
    pub old_route: Vec<Option<String>>,
    pub new_route: Vec<Option<String>>,
}

/// A user-defined threshold condition attached to a target.
///
/// `metric`, `operator`, `hop_selector`, and `action_config` are stored as
/// strings and decoded by the alert evaluator at the boundary.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: i64,
    pub target_id: i64,
    pub metric: String,
    pub operator: String,
    pub threshold: f64,
    pub duration_samples: u32,
    pub hop_selector: String,
    pub action_type: String,
    pub action_config: Option<String>,
    pub enabled: bool,
    pub consecutive_triggers: u32,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl Default for AlertRule {
    fn default() -> Self {
        Self {
            id: 0,
            target_id: 0,
            metric: "packet_loss_pct".to_string(),
            operator: ">".to_string(),
            threshold: 0.0,
            duration_samples: 1,
            hop_selector: "final".to_string(),
            action_type: "log".to_string(),
            action_config: None,
            enabled: true,
            consecutive_triggers: 0,
            last_triggered_at: None,
        }
    }
}

/// Audit row written each time an alert rule fires.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub alert_id: i64,
    pub target_id: i64,
    pub triggered_at: DateTime<Utc>,
    pub metric_value: Option<f64>,
    pub message: String,
}

/// An hourly rollup of raw samples for one (target, hop).
#[derive(Debug, Clone)]
pub struct HopRollup {
    pub target_id: i64,
    pub hop_number: u32,
    pub bucket: DateTime<Utc>,
    pub sample_count: i64,
    pub timeout_count: i64,
    pub min_ms: Option<f64>,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

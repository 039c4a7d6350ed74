//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

const TIME_FMT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Target registry ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut Target) -> Result<i64, DbError> {
        if target.interval_seconds <= 0.0 {
            target.interval_seconds = 2.5;
        }
        if target.timeout_seconds <= 0.0 {
            target.timeout_seconds = 3.0;
        }
        if target.max_hops == 0 {
            target.max_hops = 30;
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO targets (host, label, interval_seconds, max_hops, timeout_seconds, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                target.host,
                target.label,
                target.interval_seconds,
                target.max_hops,
                target.timeout_seconds,
                target.active,
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        Ok(id)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: i64) -> Result<Target, DbError> {
        let conn = self.conn.lock().unwrap();
        let target = conn
            .query_row(
                "SELECT id, host, label, interval_seconds, max_hops, timeout_seconds, active
                 FROM targets WHERE id = ?1",
                params![id],
                row_to_target,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;
        Ok(target)
    }

    /// Get all targets.
    pub fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, host, label, interval_seconds, max_hops, timeout_seconds, active
             FROM targets ORDER BY id",
        )?;
        let targets = stmt
            .query_map([], row_to_target)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Get targets with the active flag set, for resuming jobs on startup.
    pub fn get_active_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, host, label, interval_seconds, max_hops, timeout_seconds, active
             FROM targets WHERE active = 1 ORDER BY id",
        )?;
        let targets = stmt
            .query_map([], row_to_target)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Set a target's active flag.
    pub fn set_target_active(&self, id: i64, active: bool) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE targets SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Ok(())
    }

    /// Delete a target and all its dependent rows.
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM samples WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM route_changes WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM alert_history WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM alerts WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM hop_rollups WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Samples ---

    /// Add one trace run's hop rows in a single transaction.
    pub fn add_samples(&self, samples: &[Sample]) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO samples (target_id, sampled_at, hop_number, ip, dns_name, rtt_ms, is_timeout)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for s in samples {
                stmt.execute(params![
                    s.target_id,
                    s.sampled_at.format(TIME_FMT).to_string(),
                    s.hop_number,
                    s.ip,
                    s.dns_name,
                    s.rtt_ms,
                    s.is_timeout,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get the newest `limit` samples for one (target, hop), newest first.
    pub fn samples_for_hop(
        &self,
        target_id: i64,
        hop_number: u32,
        limit: u32,
    ) -> Result<Vec<Sample>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT target_id, sampled_at, hop_number, ip, dns_name, rtt_ms, is_timeout
             FROM samples WHERE target_id = ?1 AND hop_number = ?2
             ORDER BY sampled_at DESC, id DESC LIMIT ?3",
        )?;
        let samples = stmt
            .query_map(params![target_id, hop_number, limit], row_to_sample)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Every distinct hop number ever observed for a target, ascending.
    pub fn distinct_hop_numbers(&self, target_id: i64) -> Result<Vec<u32>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT hop_number FROM samples WHERE target_id = ?1 ORDER BY hop_number",
        )?;
        let hops = stmt
            .query_map(params![target_id], |row| row.get(0))?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(hops)
    }

    /// Ordered hop-IP list of the most recent run strictly before `before`.
    ///
    /// Returns `None` when no earlier run exists. Used to seed the route
    /// cache without seeing the run that was just persisted.
    pub fn last_route_before(
        &self,
        target_id: i64,
        before: DateTime<Utc>,
    ) -> Result<Option<Vec<Option<String>>>, DbError> {
        let conn = self.conn.lock().unwrap();
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(sampled_at) FROM samples WHERE target_id = ?1 AND sampled_at < ?2",
            params![target_id, before.format(TIME_FMT).to_string()],
            |row| row.get(0),
        )?;
        let latest = match latest {
            Some(t) => t,
            None => return Ok(None),
        };

        let mut stmt = conn.prepare(
            "SELECT ip FROM samples WHERE target_id = ?1 AND sampled_at = ?2 ORDER BY hop_number",
        )?;
        let ips = stmt
            .query_map(params![target_id, latest], |row| row.get(0))?
            .collect::<SqlResult<Vec<Option<String>>>>()?;
        Ok(Some(ips))
    }

    /// Backfill `dns_name` onto rows for `ip` that are still missing one.
    ///
    /// The update is bounded to `limit` rows per call so a hot IP cannot
    /// turn one sweep into an unbounded scan. Returns the rows updated.
    pub fn backfill_dns_name(&self, ip: &str, dns_name: &str, limit: u32) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE samples SET dns_name = ?2
             WHERE id IN (SELECT id FROM samples WHERE ip = ?1 AND dns_name IS NULL LIMIT ?3)",
            params![ip, dns_name, limit],
        )?;
        Ok(updated)
    }

    /// Earliest sample time for a target, if any samples exist.
    pub fn earliest_sample_time(&self, target_id: i64) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn.query_row(
            "SELECT MIN(sampled_at) FROM samples WHERE target_id = ?1",
            params![target_id],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Earliest sample time at or after `from`, used to skip empty gaps
    /// when advancing rollup windows.
    pub fn next_sample_time_at_or_after(
        &self,
        target_id: i64,
        from: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn.query_row(
            "SELECT MIN(sampled_at) FROM samples WHERE target_id = ?1 AND sampled_at >= ?2",
            params![target_id, from.format(TIME_FMT).to_string()],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// All samples for a target within [start, end), ordered by time.
    pub fn samples_between(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT target_id, sampled_at, hop_number, ip, dns_name, rtt_ms, is_timeout
             FROM samples WHERE target_id = ?1 AND sampled_at >= ?2 AND sampled_at < ?3
             ORDER BY sampled_at, hop_number",
        )?;
        let samples = stmt
            .query_map(
                params![
                    target_id,
                    start.format(TIME_FMT).to_string(),
                    end.format(TIME_FMT).to_string(),
                ],
                row_to_sample,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Delete raw samples for a target older than the cutoff.
    pub fn delete_samples_before(&self, target_id: i64, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM samples WHERE target_id = ?1 AND sampled_at < ?2",
            params![target_id, cutoff.format(TIME_FMT).to_string()],
        )?;
        Ok(deleted)
    }

    // --- Route changes ---

    /// Persist a detected route change.
    pub fn add_route_change(&self, change: &RouteChange) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO route_changes (target_id, detected_at, old_route, new_route)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                change.target_id,
                change.detected_at.format(TIME_FMT).to_string(),
                serde_json::to_string(&change.old_route).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&change.new_route).unwrap_or_else(|_| "[]".to_string()),
            ],
        )?;
        Ok(())
    }

    /// Route-change history for a target, newest first.
    pub fn route_changes(&self, target_id: i64) -> Result<Vec<RouteChange>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT target_id, detected_at, old_route, new_route
             FROM route_changes WHERE target_id = ?1 ORDER BY detected_at DESC",
        )?;
        let changes = stmt
            .query_map(params![target_id], |row| {
                let detected: String = row.get(1)?;
                let old_json: String = row.get(2)?;
                let new_json: String = row.get(3)?;
                Ok(RouteChange {
                    target_id: row.get(0)?,
                    detected_at: parse_db_time(&detected).unwrap_or_else(Utc::now),
                    old_route: serde_json::from_str(&old_json).unwrap_or_default(),
                    new_route: serde_json::from_str(&new_json).unwrap_or_default(),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(changes)
    }

    // --- Alert rules ---

    /// Add a new alert rule and return its ID.
    pub fn add_alert(&self, rule: &mut AlertRule) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (target_id, metric, operator, threshold, duration_samples,
                                 hop_selector, action_type, action_config, enabled,
                                 consecutive_triggers, last_triggered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                rule.target_id,
                rule.metric,
                rule.operator,
                rule.threshold,
                rule.duration_samples.max(1),
                rule.hop_selector,
                rule.action_type,
                rule.action_config,
                rule.enabled,
                rule.consecutive_triggers,
                rule.last_triggered_at.map(|t| t.format(TIME_FMT).to_string()),
            ],
        )?;
        let id = conn.last_insert_rowid();
        rule.id = id;
        Ok(id)
    }

    /// Enabled alert rules for a target.
    pub fn enabled_alerts(&self, target_id: i64) -> Result<Vec<AlertRule>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, target_id, metric, operator, threshold, duration_samples, hop_selector,
                    action_type, action_config, enabled, consecutive_triggers, last_triggered_at
             FROM alerts WHERE target_id = ?1 AND enabled = 1 ORDER BY id",
        )?;
        let rules = stmt
            .query_map(params![target_id], row_to_alert)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rules)
    }

    /// Get an alert rule by ID.
    pub fn get_alert(&self, id: i64) -> Result<AlertRule, DbError> {
        let conn = self.conn.lock().unwrap();
        let rule = conn
            .query_row(
                "SELECT id, target_id, metric, operator, threshold, duration_samples, hop_selector,
                        action_type, action_config, enabled, consecutive_triggers, last_triggered_at
                 FROM alerts WHERE id = ?1",
                params![id],
                row_to_alert,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;
        Ok(rule)
    }

    /// Persist an alert rule's evaluation state.
    pub fn update_alert_state(
        &self,
        id: i64,
        consecutive_triggers: u32,
        last_triggered_at: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alerts SET consecutive_triggers = ?1, last_triggered_at = ?2 WHERE id = ?3",
            params![
                consecutive_triggers,
                last_triggered_at.map(|t| t.format(TIME_FMT).to_string()),
                id,
            ],
        )?;
        Ok(())
    }

    /// Append an alert firing to the audit history.
    pub fn add_alert_event(&self, event: &AlertEvent) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_history (alert_id, target_id, triggered_at, metric_value, message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.alert_id,
                event.target_id,
                event.triggered_at.format(TIME_FMT).to_string(),
                event.metric_value,
                event.message,
            ],
        )?;
        Ok(())
    }

    /// Alert firing history for a target, newest first.
    pub fn alert_events(&self, target_id: i64) -> Result<Vec<AlertEvent>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT alert_id, target_id, triggered_at, metric_value, message
             FROM alert_history WHERE target_id = ?1 ORDER BY triggered_at DESC",
        )?;
        let events = stmt
            .query_map(params![target_id], |row| {
                let triggered: String = row.get(2)?;
                Ok(AlertEvent {
                    alert_id: row.get(0)?,
                    target_id: row.get(1)?,
                    triggered_at: parse_db_time(&triggered).unwrap_or_else(Utc::now),
                    metric_value: row.get(3)?,
                    message: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }

    // --- Hourly rollups ---

    /// Upsert a batch of hourly rollups in a single transaction.
    pub fn add_hop_rollups(&self, rollups: &[HopRollup]) -> Result<(), DbError> {
        if rollups.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO hop_rollups (target_id, hop_number, bucket, sample_count,
                                          timeout_count, min_ms, avg_ms, max_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(target_id, hop_number, bucket) DO UPDATE SET
                 sample_count=excluded.sample_count, timeout_count=excluded.timeout_count,
                 min_ms=excluded.min_ms, avg_ms=excluded.avg_ms, max_ms=excluded.max_ms",
            )?;
            for r in rollups {
                stmt.execute(params![
                    r.target_id,
                    r.hop_number,
                    r.bucket.format(TIME_FMT).to_string(),
                    r.sample_count,
                    r.timeout_count,
                    r.min_ms,
                    r.avg_ms,
                    r.max_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Start of the most recent rollup bucket for a target.
    pub fn last_rollup_bucket(&self, target_id: i64) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn.query_row(
            "SELECT MAX(bucket) FROM hop_rollups WHERE target_id = ?1",
            params![target_id],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Rollups for a target within [start, end), ordered by bucket.
    pub fn rollups_between(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HopRollup>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT target_id, hop_number, bucket, sample_count, timeout_count, min_ms, avg_ms, max_ms
             FROM hop_rollups WHERE target_id = ?1 AND bucket >= ?2 AND bucket < ?3
             ORDER BY bucket, hop_number",
        )?;
        let rollups = stmt
            .query_map(
                params![
                    target_id,
                    start.format(TIME_FMT).to_string(),
                    end.format(TIME_FMT).to_string(),
                ],
                |row| {
                    let bucket: String = row.get(2)?;
                    Ok(HopRollup {
                        target_id: row.get(0)?,
                        hop_number: row.get(1)?,
                        bucket: parse_db_time(&bucket).unwrap_or_else(Utc::now),
                        sample_count: row.get(3)?,
                        timeout_count: row.get(4)?,
                        min_ms: row.get(5)?,
                        avg_ms: row.get(6)?,
                        max_ms: row.get(7)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rollups)
    }

    /// Delete rollups for a target older than the cutoff.
    pub fn delete_rollups_before(&self, target_id: i64, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM hop_rollups WHERE target_id = ?1 AND bucket < ?2",
            params![target_id, cutoff.format(TIME_FMT).to_string()],
        )?;
        Ok(deleted)
    }
}

fn row_to_target(row: &rusqlite::Row<'_>) -> SqlResult<Target> {
    Ok(Target {
        id: row.get(0)?,
        host: row.get(1)?,
        label: row.get(2)?,
        interval_seconds: row.get(3)?,
        max_hops: row.get(4)?,
        timeout_seconds: row.get(5)?,
        active: row.get(6)?,
    })
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> SqlResult<Sample> {
    let sampled: String = row.get(1)?;
    Ok(Sample {
        target_id: row.get(0)?,
        sampled_at: parse_db_time(&sampled).unwrap_or_else(Utc::now),
        hop_number: row.get(2)?,
        ip: row.get(3)?,
        dns_name: row.get(4)?,
        rtt_ms: row.get(5)?,
        is_timeout: row.get(6)?,
    })
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> SqlResult<AlertRule> {
    let last_triggered: Option<String> = row.get(11)?;
    Ok(AlertRule {
        id: row.get(0)?,
        target_id: row.get(1)?,
        metric: row.get(2)?,
        operator: row.get(3)?,
        threshold: row.get(4)?,
        duration_samples: row.get(5)?,
        hop_selector: row.get(6)?,
        action_type: row.get(7)?,
        action_config: row.get(8)?,
        enabled: row.get(9)?,
        consecutive_triggers: row.get(10)?,
        last_triggered_at: last_triggered.and_then(|s| parse_db_time(&s)),
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

//! Route-change detection.
//!
//! Keeps the last known ordered hop-IP list per target in memory, lazily
//! seeded from durable history the first time a target is observed after
//! process start, so a change that happened during downtime is still
//! reported. After seeding, the cache is updated purely in memory.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::db::{DbError, RouteChange, Store};

/// Ordered hop-IP list; timeouts keep their position as `None`.
pub type Route = Vec<Option<String>>;

pub struct RouteDetector {
    // Key present = seeded; `None` value = no prior route existed.
    last_routes: Mutex<HashMap<i64, Option<Route>>>,
}

impl RouteDetector {
    pub fn new() -> Self {
        Self {
            last_routes: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one cycle's hop IPs through the detector.
    ///
    /// The cycle's samples are already persisted when this runs, so the
    /// seed query excludes the current run by asking only for routes
    /// recorded strictly before `detected_at`. Returns the persisted
    /// change record when the route differs from the prior one; a
    /// target's first-ever route never produces a record.
    pub fn observe(
        &self,
        store: &Store,
        target_id: i64,
        new_route: Route,
        detected_at: DateTime<Utc>,
    ) -> Result<Option<RouteChange>, DbError> {
        let mut cache = self.last_routes.lock().unwrap();

        let prior: Option<Route> = match cache.get(&target_id) {
            Some(seeded) => seeded.clone(),
            None => store.last_route_before(target_id, detected_at)?,
        };

        let change = match prior {
            Some(old_route) if old_route != new_route => {
                let change = RouteChange {
                    target_id,
                    detected_at,
                    old_route,
                    new_route: new_route.clone(),
                };
                store.add_route_change(&change)?;
                tracing::info!(
                    "Route change for target {}: {:?} -> {:?}",
                    target_id,
                    change.old_route,
                    change.new_route
                );
                Some(change)
            }
            _ => None,
        };

        cache.insert(target_id, Some(new_route));
        Ok(change)
    }

    /// Drop the cached route for a deregistered target.
    pub fn forget(&self, target_id: i64) {
        self.last_routes.lock().unwrap().remove(&target_id);
    }
}

impl Default for RouteDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Sample, Target};
    use chrono::TimeZone;
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

    fn route(ips: &[Option<&str>]) -> Route {
        ips.iter().map(|ip| ip.map(String::from)).collect()
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, secs).unwrap()
    }

    #[test]
    fn test_first_cycle_never_records() {
        let (_tmp, store, id) = seeded_store();
        let detector = RouteDetector::new();

        let change = detector
            .observe(&store, id, route(&[Some("10.0.0.1")]), at(0))
            .unwrap();
        assert!(change.is_none());
        assert!(store.route_changes(id).unwrap().is_empty());
    }

    #[test]
    fn test_second_cycle_with_new_route_records_once() {
        let (_tmp, store, id) = seeded_store();
        let detector = RouteDetector::new();

        let first = route(&[Some("10.0.0.1"), None]);
        let second = route(&[Some("10.0.0.2"), None]);

        detector.observe(&store, id, first.clone(), at(0)).unwrap();
        let change = detector
            .observe(&store, id, second.clone(), at(5))
            .unwrap()
            .expect("change expected");

        assert_eq!(change.old_route, first);
        assert_eq!(change.new_route, second);
        assert_eq!(store.route_changes(id).unwrap().len(), 1);

        // Same route again: no further records.
        let change = detector.observe(&store, id, second, at(10)).unwrap();
        assert!(change.is_none());
        assert_eq!(store.route_changes(id).unwrap().len(), 1);
    }

    #[test]
    fn test_seed_from_store_detects_downtime_change() {
        let (_tmp, store, id) = seeded_store();

        // A run persisted by a previous process lifetime.
        store
            .add_samples(&[Sample {
                target_id: id,
                sampled_at: at(0),
                hop_number: 1,
                ip: Some("10.0.0.1".to_string()),
                dns_name: None,
                rtt_ms: Some(1.0),
                is_timeout: false,
            }])
            .unwrap();

        // Fresh process: first observed cycle (already persisted at t=5)
        // differs from the stored route and must be reported.
        store
            .add_samples(&[Sample {
                target_id: id,
                sampled_at: at(5),
                hop_number: 1,
                ip: Some("10.0.0.9".to_string()),
                dns_name: None,
                rtt_ms: Some(1.0),
                is_timeout: false,
            }])
            .unwrap();

        let detector = RouteDetector::new();
        let change = detector
            .observe(&store, id, route(&[Some("10.0.0.9")]), at(5))
            .unwrap()
            .expect("downtime change expected");
        assert_eq!(change.old_route, route(&[Some("10.0.0.1")]));
    }

    #[test]
    fn test_length_change_is_a_route_change() {
        let (_tmp, store, id) = seeded_store();
        let detector = RouteDetector::new();

        detector
            .observe(&store, id, route(&[Some("10.0.0.1")]), at(0))
            .unwrap();
        let change = detector
            .observe(&store, id, route(&[Some("10.0.0.1"), Some("10.0.0.2")]), at(5))
            .unwrap();
        assert!(change.is_some());
    }

    #[test]
    fn test_forget_reseeds_from_store() {
        let (_tmp, store, id) = seeded_store();
        let detector = RouteDetector::new();

        detector
            .observe(&store, id, route(&[Some("10.0.0.1")]), at(0))
            .unwrap();
        detector.forget(id);

        // Nothing persisted before t=5, so after forgetting this counts as
        // a first observation again.
        let change = detector
            .observe(&store, id, route(&[Some("10.0.0.2")]), at(5))
            .unwrap();
        assert!(change.is_none());
    }
}

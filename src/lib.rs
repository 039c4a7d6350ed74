//! PathWatch engine: continuous network path monitoring.
//!
//! Traces the route to each registered target on an interval, keeps
//! per-hop latency/loss history in SQLite, detects route changes, and
//! evaluates threshold alert rules against focus-window statistics.
//! Transport layers (REST, WebSocket) consume the [`scheduler::Scheduler`]
//! API: `start_monitoring`/`stop_monitoring`, the latest-result caches,
//! and the live-update subscriber channels.

pub mod alerts;
pub mod config;
pub mod db;
pub mod dns;
pub mod probe;
pub mod route;
pub mod scheduler;
pub mod stats;

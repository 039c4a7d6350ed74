//! PathWatch daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use pathwatch::alerts::LogDispatcher;
use pathwatch::config::Config;
use pathwatch::db::{Store, Target};
use pathwatch::dns::DnsCache;
use pathwatch::probe::{SystemTracer, TraceMode};
use pathwatch::scheduler::Scheduler;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pathwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = Config::load();
    tracing::info!("Starting PathWatch...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    let dns = Arc::new(DnsCache::new(cfg.dns_cache_capacity));
    let tracer = Arc::new(SystemTracer::new(
        TraceMode::parse(&cfg.trace_mode),
        Duration::from_millis(cfg.inter_probe_delay_ms),
        cfg.max_consecutive_timeouts,
    ));

    let scheduler = Scheduler::new(cfg, store.clone(), tracer, dns, Arc::new(LogDispatcher));

    // Add a sample target if none exist
    if store.get_targets()?.is_empty() {
        tracing::info!("Adding sample target: one.one.one.one");
        let mut target = Target {
            host: "one.one.one.one".to_string(),
            label: Some("Cloudflare DNS".to_string()),
            ..Default::default()
        };
        store.add_target(&mut target)?;
    }

    // Resume jobs for active targets and start the global sweeps
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.shutdown();

    Ok(())
}

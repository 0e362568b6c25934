use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use omniview_sfu::{
    load_config, init_logging, mock::MockEngine, signal::{SignalEvent, SignalSink},
    MemberId, RoomId, SessionManager, WorkerPool,
};

/// Stand-in signal sink until a signaling transport is wired up; every
/// event ends up in the log.
struct LogSink;

impl SignalSink for LogSink {
    fn emit(&self, member: &MemberId, event: SignalEvent) {
        info!(target = %member, ?event, "signal emit");
    }

    fn broadcast_except(&self, room: &RoomId, except: &MemberId, event: SignalEvent) {
        info!(room = %room, except = %except, ?event, "signal broadcast");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = load_config()?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!(e))?;
    info!("OmniView server starting...");

    // 4. Bring up the worker pool
    let worker_count = config.worker.resolved_count();
    let pool = WorkerPool::new(MockEngine::new());
    pool.initialize(worker_count, &config.worker.engine_settings())
        .await?;
    info!(workers = worker_count, "worker pool ready");

    // 5. Session manager; the signaling transport plugs in here
    let sessions = SessionManager::new(
        Arc::clone(&pool),
        config.clone(),
        Arc::new(LogSink),
    );
    info!("session manager initialized");

    // 6. Periodic worker diagnostics
    let diagnostics_pool = Arc::clone(&pool);
    let diagnostics_sessions = Arc::clone(&sessions);
    let diagnostics_interval = Duration::from_millis(config.monitoring.stats_interval_ms * 10);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(diagnostics_interval);
        loop {
            ticker.tick().await;
            for (index, usage) in diagnostics_pool.resource_usage().await {
                info!(
                    worker = index,
                    cpu_user_ms = usage.cpu_user_ms,
                    cpu_system_ms = usage.cpu_system_ms,
                    rooms = diagnostics_sessions.room_count(),
                    "worker diagnostics"
                );
            }
        }
    });

    // 7. Run until interrupted
    info!("OmniView server running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, exiting");

    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, now_ms};

const CLOSE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that closes registration on events whose `close_at` has passed.
pub async fn run_closer(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(CLOSE_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        close_due_events(&engine).await;
    }
}

pub async fn close_due_events(engine: &Engine) -> usize {
    let now = now_ms();
    let mut closed = 0;
    for event_id in engine.collect_due_closures(now) {
        match engine.close_if_due(event_id, now).await {
            Ok(true) => {
                info!("registration closed on schedule for event {event_id}");
                closed += 1;
            }
            Ok(false) => {}
            Err(e) => {
                // Busy events are picked up on the next tick.
                tracing::debug!("closer skip {event_id}: {e}");
            }
        }
    }
    closed
}

/// Background task that rewrites the WAL once enough commits have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} commits"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
        engine.notify.prune();
    }
}

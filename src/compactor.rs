use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Background task that compacts the WAL once `threshold` appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(live) => {
            debug!(appends, live, "compaction done");
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "ok")
                .increment(1);
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "error")
                .increment(1);
            false
        }
    }
}

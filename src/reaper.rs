use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::BookingEngine;
use crate::store::WalStore;

/// Background task that drops cache entries too old to serve even as stale.
pub async fn run_cache_sweeper(engine: Arc<BookingEngine>, every: Duration, max_stale: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let purged = engine.sweep_caches(max_stale);
        if purged > 0 {
            debug!("cache sweep purged {purged} entries");
        }
    }
}

/// Background task that compacts the store WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<WalStore>, every: Duration, threshold: u64) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}

/// Returns whether a compaction ran and succeeded.
pub async fn compact_if_needed(store: &WalStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!("compacted store WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("store WAL compaction failed: {e}");
            false
        }
    }
}

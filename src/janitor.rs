use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background maintenance: purge expired idempotency entries and rewrite
/// the journal once enough appends have accumulated. Runs on its own task;
/// the commit path never does either inline.
pub async fn run_janitor(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    let threshold = engine.config().compact_threshold;
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;

        engine.purge_idempotency(now);

        let appends = engine.journal_appends_since_compact().await;
        if appends >= threshold {
            debug!("compacting journal after {appends} appends");
            match engine.compact_journal().await {
                Ok(()) => info!("journal compacted"),
                Err(e) => warn!("journal compaction failed: {e}"),
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::store::SnapshotStore;

/// Periodically refreshes the snapshot. The first pass runs one `period` from now.
pub fn spawn_refresher(store: Arc<SnapshotStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = store.refresh().await;
            if report.failed_repositories > 0 {
                warn!(failed = report.failed_repositories, "refresh left repositories unknown");
            } else {
                debug!(
                    cluster = ?report.cluster,
                    repositories = report.repositories,
                    "refresh done"
                );
            }
        }
    })
}

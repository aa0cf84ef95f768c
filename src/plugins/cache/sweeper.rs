//! Periodic eviction task

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::ProxyCache;
use crate::database::Database;

/// Run [`ProxyCache::sweep`] every `every` until shutdown is signalled
///
/// The repository list is re-read on each tick so deleted repositories
/// lose their entries and new overrides apply without a restart.
pub fn spawn_sweeper(
    cache: Arc<ProxyCache>,
    db: Arc<dyn Database>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = every.as_secs(), "Cache sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Cache sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let repos = match db.list_repositories().await {
                        Ok(repos) => repos,
                        Err(e) => {
                            warn!(error = %e, "Cache sweep skipped: repositories unavailable");
                            continue;
                        }
                    };
                    match cache.sweep(&repos).await {
                        Ok(evicted) => debug!(evicted, "Cache sweep finished"),
                        Err(e) => warn!(error = %e, "Cache sweep failed"),
                    }
                }
            }
        }
    })
}

//! Periodic estimator updates from cluster usage.
//!
//! Every tick, the updater snapshots which running applications sit on which
//! node, pulls the windowed usage means from the metrics store, and feeds the
//! estimators one leave-one-out observation per co-located application.
//! Sampling happens outside the scheduler lock; only the estimator update
//! itself is synchronized.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::scheduler::Scheduler;
use crate::stats::StatCollector;

/// Yield `(rest, out)` for every element of `items`, attributing a joint
/// observation to each participant in turn.
pub fn leave_one_out<T: Clone>(items: &[T]) -> Vec<(Vec<T>, T)> {
    (0..items.len())
        .map(|out| {
            let rest = items
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != out)
                .map(|(_, item)| item.clone())
                .collect();
            (rest, items[out].clone())
        })
        .collect()
}

/// Repeating timer that feeds usage rates to the estimators.
pub struct UsageUpdater {
    scheduler: Arc<Scheduler>,
    stats: Arc<dyn StatCollector>,
    interval: Duration,
    window_secs: u64,
}

impl UsageUpdater {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(
        scheduler: Arc<Scheduler>,
        stats: Arc<dyn StatCollector>,
        interval: Duration,
        window_secs: u64,
    ) -> Self {
        Self {
            scheduler,
            stats,
            interval,
            window_secs,
        }
    }

    /// Run the timer until the scheduler signals shutdown.  Cancellation is
    /// observed before the next tick fires.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut shutdown = self.scheduler.subscribe_shutdown();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; skip it so
            // the first observation covers a full window.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("usage updater stopped");
        })
    }

    /// One sampling pass.  Metrics-store failures skip the tick; the next one
    /// retries.
    pub async fn tick(&self) {
        let (addresses, node_apps) = self.scheduler.usage_snapshot();
        if addresses.is_empty() {
            return;
        }

        let usage = match self.stats.mean_usage(&addresses, self.window_secs).await {
            Ok(usage) => usage,
            Err(error) => {
                warn!(%error, "usage sampling failed, skipping this tick");
                return;
            }
        };

        self.scheduler.record_usage(&node_apps, &usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leave_one_out_enumerates_every_holdout() {
        let pairs = leave_one_out(&[1, 2, 3]);

        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], (vec![2, 3], 1));
        assert_eq!(pairs[1], (vec![1, 3], 2));
        assert_eq!(pairs[2], (vec![1, 2], 3));
    }

    #[test]
    fn leave_one_out_of_singleton_has_empty_rest() {
        let pairs = leave_one_out(&["only"]);
        assert_eq!(pairs, vec![(vec![], "only")]);
    }

    #[test]
    fn leave_one_out_of_empty_is_empty() {
        assert!(leave_one_out::<u8>(&[]).is_empty());
    }
}

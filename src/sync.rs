use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::PlaceCache;
use crate::frequent::RecomputeHandle;
use crate::monitoring::timed;
use crate::retry::RetryPolicy;
use crate::store::{keys, write_json, BlobStore};

const FLUSH_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A flush was already running; this trigger did nothing.
    AlreadyRunning,
    Clean,
    Flushed { written: usize, failed: usize },
}

pub struct VariableSync {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    cache: Arc<PlaceCache>,
    in_progress: AtomicBool,
    flushed_runs: AtomicU64,
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl VariableSync {
    pub fn new(store: Arc<dyn BlobStore>, retry: RetryPolicy, cache: Arc<PlaceCache>) -> Self {
        Self {
            store,
            retry,
            cache,
            in_progress: AtomicBool::new(false),
            flushed_runs: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn flushed_runs(&self) -> u64 {
        self.flushed_runs.load(Ordering::SeqCst)
    }

    pub async fn sync(&self) -> SyncOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(target: "sync", "sync already in progress; skipping trigger");
            return SyncOutcome::AlreadyRunning;
        }
        let _running = InProgress(&self.in_progress);

        let snapshots = self.cache.take_dirty();
        if snapshots.is_empty() {
            return SyncOutcome::Clean;
        }

        let store = self.store.as_ref();
        let retry = &self.retry;
        let results: Vec<(String, bool)> = stream::iter(snapshots)
            .map(|snapshot| async move {
                let key = keys::variable_data(snapshot.last_updated.date_naive(), &snapshot.place_id);
                let outcome = retry
                    .execute("variable_sync", || write_json(store, &key, &snapshot))
                    .await;
                if let Err(err) = &outcome {
                    warn!(target: "sync", ?err, key = %key, "variable data flush failed");
                }
                (snapshot.place_id, outcome.is_ok())
            })
            .buffer_unordered(FLUSH_CONCURRENCY)
            .collect()
            .await;

        let failed: Vec<String> = results
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(id, _)| id.clone())
            .collect();
        let written = results.len() - failed.len();
        if !failed.is_empty() {
            self.cache.mark_dirty(failed.iter().cloned());
        }
        self.flushed_runs.fetch_add(1, Ordering::SeqCst);
        info!(target: "sync", written, failed = failed.len(), "variable data synced");
        SyncOutcome::Flushed {
            written,
            failed: failed.len(),
        }
    }
}

pub fn spawn_scheduler(
    sync: Arc<VariableSync>,
    recompute: RecomputeHandle,
    sync_every: Duration,
    recompute_every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sync_tick = interval(sync_every);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut recompute_tick = interval(recompute_every);
        recompute_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Both intervals fire immediately; the first real trigger is one period out.
        sync_tick.tick().await;
        recompute_tick.tick().await;

        loop {
            tokio::select! {
                _ = sync_tick.tick() => {
                    let sync = Arc::clone(&sync);
                    tokio::spawn(async move {
                        timed("variable_sync", sync.sync()).await;
                    });
                }
                _ = recompute_tick.tick() => {
                    recompute.request();
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(target: "sync", "scheduler stopped");
    })
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::PlaceCache;
use crate::errors::AppResult;
use crate::frequency::{FrequencyMap, FrequencyTracker};
use crate::lock::{LockTable, FREQUENT_PLACES_UPDATE};
use crate::monitoring::timed;
use crate::places::{parse_place_collection, FrequentPlace, Place};
use crate::retry::RetryPolicy;
use crate::store::{keys, read_json, write_json, BlobStore};

#[derive(Debug, Clone)]
pub enum RecomputeOutcome {
    Updated(Arc<Vec<FrequentPlace>>),
    /// Another recomputation held the lock; nothing was read or written.
    AlreadyRunning,
}

pub struct FrequentSetRecomputer {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    cache: Arc<PlaceCache>,
    tracker: Arc<FrequencyTracker>,
    locks: LockTable,
    threshold: u64,
    completed_runs: AtomicU64,
}

impl FrequentSetRecomputer {
    pub fn new(
        store: Arc<dyn BlobStore>,
        retry: RetryPolicy,
        cache: Arc<PlaceCache>,
        tracker: Arc<FrequencyTracker>,
        locks: LockTable,
        threshold: u64,
    ) -> Self {
        Self {
            store,
            retry,
            cache,
            tracker,
            locks,
            threshold,
            completed_runs: AtomicU64::new(0),
        }
    }

    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::SeqCst)
    }

    pub async fn recompute(&self) -> AppResult<RecomputeOutcome> {
        let Some(_guard) = self.locks.try_acquire(FREQUENT_PLACES_UPDATE) else {
            debug!(target: "frequent", "recompute already in progress; skipping");
            return Ok(RecomputeOutcome::AlreadyRunning);
        };

        let (places, counts) = tokio::try_join!(self.load_places(), self.tracker.load())?;
        let list = derive_frequent(&places, &counts, self.threshold);

        self.retry
            .execute("frequent_persist", || {
                write_json(self.store.as_ref(), keys::FREQUENT_PLACES, &list)
            })
            .await?;
        let list = self.cache.set_frequent_places(list);
        self.completed_runs.fetch_add(1, Ordering::SeqCst);
        info!(
            target: "frequent",
            candidates = places.len(),
            frequent = list.len(),
            threshold = self.threshold,
            "frequent places recomputed"
        );
        Ok(RecomputeOutcome::Updated(list))
    }

    pub async fn frequent_places(&self) -> Arc<Vec<FrequentPlace>> {
        if let Some(list) = self.cache.frequent_places() {
            return list;
        }

        let store = self.store.as_ref();
        match self
            .retry
            .execute("frequent_load", || {
                read_json::<Vec<FrequentPlace>>(store, keys::FREQUENT_PLACES)
            })
            .await
        {
            Ok(list) => self.cache.set_frequent_places(list),
            Err(err) if err.is_not_found() => Arc::new(Vec::new()),
            Err(err) => {
                warn!(target: "frequent", ?err, "failed to load frequent places; serving empty list");
                Arc::new(Vec::new())
            }
        }
    }

    async fn load_places(&self) -> AppResult<Vec<Place>> {
        let store = self.store.as_ref();
        let bytes = self
            .retry
            .execute("frequent_load_places", || store.read(keys::BASE_PLACES))
            .await?;
        parse_place_collection(keys::BASE_PLACES, &bytes)
    }
}

pub fn derive_frequent(places: &[Place], counts: &FrequencyMap, threshold: u64) -> Vec<FrequentPlace> {
    let mut list: Vec<FrequentPlace> = places
        .iter()
        .filter(|place| place.validate().is_ok())
        .filter_map(|place| {
            let count = counts.get(&place.id).copied().unwrap_or(0);
            (count >= threshold).then(|| FrequentPlace::project(place, count))
        })
        .collect();
    list.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.id.cmp(&b.id)));
    list
}

#[derive(Clone)]
pub struct RecomputeHandle {
    tx: mpsc::Sender<()>,
}

impl RecomputeHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<()>) -> Self {
        Self { tx }
    }

    /// Returns `false` when the request was coalesced or the worker is gone.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!(target: "frequent", "recompute already queued; coalescing");
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!(target: "frequent", "recompute worker stopped; request dropped");
                false
            }
        }
    }
}

pub fn spawn_recompute_worker(
    recomputer: Arc<FrequentSetRecomputer>,
    mut shutdown: watch::Receiver<bool>,
) -> (RecomputeHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<()>(1);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                request = rx.recv() => {
                    if request.is_none() {
                        break;
                    }
                    if let Err(err) = timed("frequent_recompute", recomputer.recompute()).await {
                        warn!(target: "frequent", ?err, "background recompute failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(target: "frequent", "recompute worker stopped");
    });
    (RecomputeHandle { tx }, task)
}

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, PlaceCache};
use crate::clock::Clock;
use crate::config::{AppConfig, PublicAppConfig};
use crate::congestion::{CongestionApi, CongestionCache};
use crate::errors::{AppError, AppResult};
use crate::frequency::FrequencyTracker;
use crate::frequent::{spawn_recompute_worker, FrequentSetRecomputer, RecomputeHandle, RecomputeOutcome};
use crate::lock::LockTable;
use crate::places::{
    parse_place_collection, FrequentPlace, Place, PlaceDetail, SearchHit, VariableSnapshot,
    VariableUpdate,
};
use crate::retry::RetryPolicy;
use crate::store::{keys, read_json, write_json, BlobStore};
use crate::sync::{spawn_scheduler, SyncOutcome, VariableSync};

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub cache: CacheStats,
    pub recompute_runs: u64,
    pub sync_runs: u64,
    pub congestion_api_calls: u64,
    pub config: PublicAppConfig,
}

pub struct Coordinator {
    config: AppConfig,
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    cache: Arc<PlaceCache>,
    tracker: Arc<FrequencyTracker>,
    recomputer: Arc<FrequentSetRecomputer>,
    sync: Arc<VariableSync>,
    congestion: Option<Arc<CongestionCache>>,
    recompute: RecomputeHandle,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    collection_guard: AsyncMutex<()>,
}

impl Coordinator {
    pub async fn initialize(
        config: AppConfig,
        store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        congestion_api: Option<Arc<dyn CongestionApi>>,
    ) -> AppResult<Self> {
        let retry = config.store_retry_policy();
        let cache = Arc::new(PlaceCache::new(clock, config.cache_ttl()));
        let tracker = Arc::new(FrequencyTracker::new(Arc::clone(&store), retry.clone()));
        let recomputer = Arc::new(FrequentSetRecomputer::new(
            Arc::clone(&store),
            retry.clone(),
            Arc::clone(&cache),
            Arc::clone(&tracker),
            LockTable::new(),
            config.frequent_threshold,
        ));
        let sync = Arc::new(VariableSync::new(
            Arc::clone(&store),
            retry.clone(),
            Arc::clone(&cache),
        ));
        let congestion = congestion_api.map(|api| {
            Arc::new(CongestionCache::new(
                Arc::clone(&store),
                api,
                retry.clone(),
                config.congestion_timeout(),
                config.congestion_window_days,
            ))
        });
        if congestion.is_none() {
            warn!(target: "coordinator", "no congestion API configured; congestion lookups return nothing");
        }

        let places = load_collection(store.as_ref(), &retry).await?;
        let loaded = places.len();
        let listing = cache.set_full_listing(places);
        if let Some(congestion) = &congestion {
            congestion.index_places(&listing);
        }
        let frequent = recomputer.frequent_places().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (recompute, worker) = spawn_recompute_worker(Arc::clone(&recomputer), shutdown_rx.clone());
        let scheduler = spawn_scheduler(
            Arc::clone(&sync),
            recompute.clone(),
            config.sync_interval(),
            config.recompute_interval(),
            shutdown_rx,
        );

        info!(
            target: "coordinator",
            places = loaded,
            frequent = frequent.len(),
            sync_interval_ms = config.sync_interval_ms,
            "coordinator initialized"
        );

        Ok(Self {
            config,
            store,
            retry,
            cache,
            tracker,
            recomputer,
            sync,
            congestion,
            recompute,
            shutdown_tx,
            tasks: Mutex::new(vec![worker, scheduler]),
            collection_guard: AsyncMutex::new(()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The static record for `id`. `Ok(None)` means the collection has no such place.
    pub async fn lookup_place(&self, id: &str) -> AppResult<Option<Place>> {
        if let Some(place) = self.cache.get(id) {
            return Ok(Some(place));
        }
        let listing = self.all_places().await?;
        let found = listing.iter().find(|place| place.id == id).cloned();
        if let Some(place) = &found {
            self.cache.put(id, place.clone());
        }
        Ok(found)
    }

    pub async fn all_places(&self) -> AppResult<Arc<Vec<Place>>> {
        if let Some(listing) = self.cache.full_listing() {
            return Ok(listing);
        }
        debug!(target: "coordinator", "full listing expired; reloading");
        let places = load_collection(self.store.as_ref(), &self.retry).await?;
        let listing = self.cache.set_full_listing(places);
        if let Some(congestion) = &self.congestion {
            congestion.index_places(&listing);
        }
        Ok(listing)
    }

    pub async fn place_detail(&self, id: &str) -> AppResult<Option<PlaceDetail>> {
        let Some(place) = self.lookup_place(id).await? else {
            return Ok(None);
        };

        let key = keys::place_details(id);
        let store = self.store.as_ref();
        let details = match self
            .retry
            .execute("place_details_load", || read_json::<Value>(store, &key))
            .await
        {
            Ok(details) => Some(details),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                warn!(target: "coordinator", ?err, key = %key, "place details unavailable");
                None
            }
        };

        Ok(Some(PlaceDetail {
            place,
            details,
            current_data: self.cache.get_variable(id),
        }))
    }

    pub async fn record_access(&self, id: &str) -> AppResult<u64> {
        let count = self.tracker.increment(id).await?;
        self.recompute.request();
        Ok(count)
    }

    pub async fn access_count(&self, id: &str) -> AppResult<u64> {
        self.tracker.get(id).await
    }

    pub async fn frequent_places(&self) -> Arc<Vec<FrequentPlace>> {
        self.recomputer.frequent_places().await
    }

    pub fn update_variable_data(&self, id: &str, update: VariableUpdate) -> AppResult<VariableSnapshot> {
        if id.trim().is_empty() {
            return Err(AppError::Integrity("variable data needs a place id".into()));
        }
        update.validate()?;
        Ok(self.cache.set_variable(id, update))
    }

    pub fn variable_data(&self, id: &str) -> Option<VariableSnapshot> {
        self.cache.get_variable(id)
    }

    pub async fn search(&self, query: &str) -> Vec<SearchHit> {
        let needle = query.trim();
        if needle.is_empty() {
            return Vec::new();
        }

        let frequent = self.frequent_places().await;
        let hits: Vec<SearchHit> = frequent
            .iter()
            .filter(|place| place.matches_query(needle))
            .map(|place| SearchHit {
                id: place.id.clone(),
                name: place.name.clone(),
                location: place.location.clone(),
                frequent: true,
                current_crowd: self.current_crowd(&place.id),
            })
            .collect();
        if !hits.is_empty() {
            return hits;
        }

        match self.all_places().await {
            Ok(listing) => listing
                .iter()
                .filter(|place| place.matches_query(needle))
                .map(|place| SearchHit {
                    id: place.id.clone(),
                    name: place.name.clone(),
                    location: place.location.clone(),
                    frequent: false,
                    current_crowd: self.current_crowd(&place.id),
                })
                .collect(),
            Err(err) => {
                warn!(target: "coordinator", ?err, "search fell back to an empty result");
                Vec::new()
            }
        }
    }

    pub async fn get_congestion(&self, date: NaiveDate, id: &str) -> Option<f64> {
        let congestion = self.congestion.as_ref()?;
        let place = match self.lookup_place(id).await {
            Ok(Some(place)) => place,
            Ok(None) => {
                debug!(target: "coordinator", place_id = id, "congestion requested for unknown place");
                return None;
            }
            Err(err) => {
                warn!(target: "coordinator", ?err, place_id = id, "place lookup failed");
                return None;
            }
        };
        congestion.get(date, &place).await
    }

    pub async fn recompute(&self) -> AppResult<RecomputeOutcome> {
        self.recomputer.recompute().await
    }

    pub fn request_recompute(&self) -> bool {
        self.recompute.request()
    }

    pub async fn sync(&self) -> SyncOutcome {
        self.sync.sync().await
    }

    pub async fn replace_place(&self, place: Place) -> AppResult<()> {
        place.validate()?;
        let _serialized = self.collection_guard.lock().await;

        let store = self.store.as_ref();
        let mut records = match self
            .retry
            .execute("collection_load", || store.read(keys::BASE_PLACES))
            .await
        {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Array(records)) => records,
                _ => {
                    return Err(AppError::Integrity(format!(
                        "`{}` must contain an array of places",
                        keys::BASE_PLACES
                    )))
                }
            },
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };

        let replacement = serde_json::to_value(&place)?;
        match records
            .iter()
            .position(|record| record_id(record).as_deref() == Some(place.id.as_str()))
        {
            Some(index) => records[index] = replacement,
            None => records.push(replacement),
        }

        self.retry
            .execute("collection_persist", || {
                write_json(store, keys::BASE_PLACES, &records)
            })
            .await?;
        self.cache.invalidate(&place.id);
        self.cache.invalidate_full_listing();
        self.recompute.request();
        info!(target: "coordinator", place_id = %place.id, "place replaced");
        Ok(())
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            cache: self.cache.stats(),
            recompute_runs: self.recomputer.completed_runs(),
            sync_runs: self.sync.flushed_runs(),
            congestion_api_calls: self
                .congestion
                .as_ref()
                .map(|congestion| congestion.api_calls())
                .unwrap_or(0),
            config: self.config.public_profile(),
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(target: "coordinator", ?err, "background task ended abnormally");
            }
        }

        while self.sync.is_running() {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        let outcome = self.sync.sync().await;
        if let Some(congestion) = &self.congestion {
            congestion.settle().await;
        }
        info!(target: "coordinator", ?outcome, "coordinator stopped");
    }

    fn current_crowd(&self, id: &str) -> u32 {
        self.cache
            .get_variable(id)
            .map(|snapshot| snapshot.crowd)
            .unwrap_or(0)
    }
}

async fn load_collection(store: &dyn BlobStore, retry: &RetryPolicy) -> AppResult<Vec<Place>> {
    let bytes = retry
        .execute("collection_load", || store.read(keys::BASE_PLACES))
        .await?;
    parse_place_collection(keys::BASE_PLACES, &bytes)
}

fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::congestion::{CongestionObservation, CongestionQuery};
    use crate::places::Weather;
    use crate::store::MemoryBlobStore;

    fn test_config() -> AppConfig {
        AppConfig {
            store_retry_base_ms: 1,
            ..AppConfig::default()
        }
    }

    fn seeded_store() -> MemoryBlobStore {
        let store = MemoryBlobStore::new();
        store.insert_json(
            keys::BASE_PLACES,
            &json!([
                {
                    "id": "p1",
                    "name": "Gyeongbokgung",
                    "location": "Jongno-gu",
                    "searchKeywords": ["palace"],
                    "areaCode": "11",
                    "districtCode": "11110"
                },
                { "id": "p2", "name": "Namsan Tower", "location": "Yongsan-gu" },
                { "id": "p3", "name": "Deoksugung", "searchKeywords": ["palace"] }
            ]),
        );
        store.insert_json(keys::FREQUENCY, &json!({ "p1": 19, "p3": 40 }));
        store
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap())
    }

    async fn start(store: &MemoryBlobStore, clock: &ManualClock) -> Coordinator {
        Coordinator::initialize(
            test_config(),
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            None,
        )
        .await
        .unwrap()
    }

    fn crowd(value: u32) -> VariableUpdate {
        VariableUpdate {
            crowd: value,
            weather: Weather {
                condition: "clear".into(),
                temperature_c: Some(9.0),
                precipitation_chance: Some(0),
            },
        }
    }

    async fn wait_for_frequent(coordinator: &Coordinator, id: &str) -> bool {
        for _ in 0..100 {
            if coordinator.frequent_places().await.iter().any(|p| p.id == id) {
                return true;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn place_crosses_threshold_after_one_more_access() {
        let store = seeded_store();
        let coordinator = start(&store, &clock()).await;

        coordinator.recompute().await.unwrap();
        let before: Vec<_> = coordinator
            .frequent_places()
            .await
            .iter()
            .map(|p| p.id.clone())
            .collect();
        assert_eq!(before, vec!["p3"]);

        assert_eq!(coordinator.record_access("p1").await.unwrap(), 20);
        assert!(wait_for_frequent(&coordinator, "p1").await);
        let after = coordinator.frequent_places().await;
        assert_eq!(after[1].id, "p1");
        assert_eq!(after[1].frequency, 20);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn lookups_hit_cache_until_expiry() {
        let store = seeded_store();
        let clock = clock();
        let coordinator = start(&store, &clock).await;
        assert_eq!(store.read_count(keys::BASE_PLACES), 1);

        let place = coordinator.lookup_place("p2").await.unwrap().unwrap();
        assert_eq!(place.name, "Namsan Tower");
        assert!(coordinator.lookup_place("missing").await.unwrap().is_none());
        assert_eq!(store.read_count(keys::BASE_PLACES), 1);

        clock.advance(StdDuration::from_secs(24 * 3600));
        assert!(coordinator.lookup_place("p2").await.unwrap().is_some());
        assert_eq!(store.read_count(keys::BASE_PLACES), 2);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn initialize_requires_a_readable_collection() {
        let empty = MemoryBlobStore::new();
        let err = Coordinator::initialize(test_config(), Arc::new(empty), Arc::new(clock()), None)
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());

        let malformed = MemoryBlobStore::new();
        malformed.insert_json(keys::BASE_PLACES, &json!({ "places": [] }));
        let err = Coordinator::initialize(test_config(), Arc::new(malformed), Arc::new(clock()), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Integrity(_)));
    }

    #[tokio::test]
    async fn search_prefers_frequent_places() {
        let store = seeded_store();
        let coordinator = start(&store, &clock()).await;
        coordinator.recompute().await.unwrap();
        coordinator.update_variable_data("p2", crowd(73)).unwrap();

        let palaces = coordinator.search("PALACE").await;
        assert_eq!(palaces.len(), 1);
        assert_eq!(palaces[0].id, "p3");
        assert!(palaces[0].frequent);

        let tower = coordinator.search("tower").await;
        assert_eq!(tower.len(), 1);
        assert!(!tower[0].frequent);
        assert_eq!(tower[0].current_crowd, 73);

        assert!(coordinator.search("  ").await.is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn detail_merges_optional_documents() {
        let store = seeded_store();
        store.insert_json(
            &keys::place_details("p1"),
            &json!({ "openingHours": "09:00-18:00" }),
        );
        let coordinator = start(&store, &clock()).await;
        coordinator.update_variable_data("p1", crowd(12)).unwrap();

        let detail = coordinator.place_detail("p1").await.unwrap().unwrap();
        assert_eq!(detail.details.unwrap()["openingHours"], "09:00-18:00");
        assert_eq!(detail.current_data.unwrap().crowd, 12);

        let bare = coordinator.place_detail("p2").await.unwrap().unwrap();
        assert!(bare.details.is_none());
        assert!(bare.current_data.is_none());
        assert!(coordinator.place_detail("nope").await.unwrap().is_none());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn replace_place_rewrites_collection_and_invalidates() {
        let store = seeded_store();
        let coordinator = start(&store, &clock()).await;
        let mut renamed = coordinator.lookup_place("p2").await.unwrap().unwrap();
        renamed.name = "N Seoul Tower".into();

        coordinator.replace_place(renamed).await.unwrap();
        let persisted: Vec<Value> = store.get_json(keys::BASE_PLACES).unwrap();
        assert_eq!(persisted.len(), 3);
        assert_eq!(persisted[1]["name"], "N Seoul Tower");
        assert_eq!(
            coordinator.lookup_place("p2").await.unwrap().unwrap().name,
            "N Seoul Tower"
        );

        let invalid: Place = serde_json::from_value(json!({ "id": "p9", "name": " " })).unwrap();
        assert!(coordinator.replace_place(invalid).await.is_err());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn replace_place_propagates_write_failures() {
        let store = seeded_store();
        let coordinator = start(&store, &clock()).await;
        let place = coordinator.lookup_place("p2").await.unwrap().unwrap();

        store.fail_next_writes(3);
        let err = coordinator.replace_place(place).await.unwrap_err();
        assert!(err.is_transient());
        assert!(coordinator.lookup_place("p2").await.unwrap().is_some());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_variable_data() {
        let store = seeded_store();
        let coordinator = start(&store, &clock()).await;
        coordinator.update_variable_data("p1", crowd(88)).unwrap();
        assert!(coordinator
            .update_variable_data("p1", VariableUpdate {
                crowd: 1,
                weather: Weather {
                    condition: String::new(),
                    temperature_c: None,
                    precipitation_chance: None,
                },
            })
            .is_err());

        coordinator.shutdown().await;
        let written: VariableSnapshot = store
            .get_json("data/variable_data/250314/p1.json")
            .unwrap();
        assert_eq!(written.crowd, 88);
        assert_eq!(coordinator.stats().cache.dirty_entries, 0);
    }

    struct FixedApi;

    #[async_trait]
    impl CongestionApi for FixedApi {
        async fn fetch(&self, query: &CongestionQuery) -> AppResult<Vec<CongestionObservation>> {
            Ok(vec![CongestionObservation {
                place: query.name_filter.clone().unwrap_or_default(),
                date: query.start,
                rate: Some(55.5),
            }])
        }
    }

    #[tokio::test]
    async fn congestion_goes_through_place_lookup() {
        let store = seeded_store();
        let coordinator = Coordinator::initialize(
            test_config(),
            Arc::new(store.clone()),
            Arc::new(clock()),
            Some(Arc::new(FixedApi)),
        )
        .await
        .unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();

        assert_eq!(coordinator.get_congestion(date, "p1").await, Some(55.5));
        assert_eq!(coordinator.get_congestion(date, "p1").await, Some(55.5));
        assert_eq!(coordinator.get_congestion(date, "missing").await, None);
        assert_eq!(coordinator.get_congestion(date, "p2").await, None);
        assert_eq!(coordinator.stats().congestion_api_calls, 1);

        coordinator.shutdown().await;
        assert!(store.contains("kto/250314/p1.json"));
    }

    struct DistrictApi;

    #[async_trait]
    impl CongestionApi for DistrictApi {
        async fn fetch(&self, query: &CongestionQuery) -> AppResult<Vec<CongestionObservation>> {
            Ok(vec![
                CongestionObservation {
                    place: "Gyeongbokgung".into(),
                    date: query.start,
                    rate: Some(55.5),
                },
                CongestionObservation {
                    place: "Changdeokgung".into(),
                    date: query.start,
                    rate: Some(20.0),
                },
            ])
        }
    }

    #[tokio::test]
    async fn district_batch_prewarms_neighbouring_places() {
        let store = MemoryBlobStore::new();
        store.insert_json(
            keys::BASE_PLACES,
            &json!([
                { "id": "p1", "name": "Gyeongbokgung", "areaCode": "11", "districtCode": "11110" },
                { "id": "p4", "name": "Changdeokgung", "areaCode": "11", "districtCode": "11110" }
            ]),
        );
        let coordinator = Coordinator::initialize(
            test_config(),
            Arc::new(store.clone()),
            Arc::new(clock()),
            Some(Arc::new(DistrictApi)),
        )
        .await
        .unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();

        assert_eq!(coordinator.get_congestion(date, "p1").await, Some(55.5));
        assert_eq!(coordinator.get_congestion(date, "p4").await, Some(20.0));
        assert_eq!(coordinator.stats().congestion_api_calls, 1);

        coordinator.shutdown().await;
        assert_eq!(
            store.keys_with_prefix("kto/"),
            vec!["kto/250314/p1.json", "kto/250314/p4.json"]
        );
    }

    #[tokio::test]
    async fn evicted_entry_is_repopulated_from_listing() {
        let store = seeded_store();
        let coordinator = start(&store, &clock()).await;
        coordinator.cache.invalidate("p2");
        assert!(coordinator.cache.get("p2").is_none());

        assert!(coordinator.lookup_place("p2").await.unwrap().is_some());
        assert!(coordinator.cache.get("p2").is_some());
        assert_eq!(store.read_count(keys::BASE_PLACES), 1);
        coordinator.shutdown().await;
    }
}

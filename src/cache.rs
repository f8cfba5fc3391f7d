use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::clock::Clock;
use crate::places::{FrequentPlace, Place, VariableSnapshot, VariableUpdate};

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Expiring<T> {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct CacheState {
    places: HashMap<String, Expiring<Place>>,
    variables: HashMap<String, VariableSnapshot>,
    dirty: HashSet<String>,
    full_listing: Option<Expiring<Arc<Vec<Place>>>>,
    frequent: Option<Arc<Vec<FrequentPlace>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cached_places: usize,
    pub live_places: usize,
    pub variable_entries: usize,
    pub dirty_entries: usize,
    pub full_listing_valid: bool,
    pub frequent_cached: bool,
}

pub struct PlaceCache {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl PlaceCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Place> {
        let now = self.clock.now();
        let state = self.state.lock();
        match state.places.get(id) {
            Some(entry) if entry.is_valid(now) => Some(entry.value.clone()),
            Some(_) => {
                trace!(target: "place_cache", id, "entry expired");
                None
            }
            None => None,
        }
    }

    pub fn put(&self, id: &str, place: Place) {
        let expires_at = self.clock.now() + self.ttl;
        self.state.lock().places.insert(
            id.to_string(),
            Expiring {
                value: place,
                expires_at,
            },
        );
    }

    pub fn get_variable(&self, id: &str) -> Option<VariableSnapshot> {
        self.state.lock().variables.get(id).cloned()
    }

    pub fn set_variable(&self, id: &str, update: VariableUpdate) -> VariableSnapshot {
        let snapshot = update.stamp(id, self.clock.now());
        let mut state = self.state.lock();
        state.variables.insert(id.to_string(), snapshot.clone());
        state.dirty.insert(id.to_string());
        snapshot
    }

    pub fn invalidate(&self, id: &str) {
        self.state.lock().places.remove(id);
    }

    pub fn invalidate_full_listing(&self) {
        self.state.lock().full_listing = None;
    }

    pub fn invalidate_all(&self) {
        let mut state = self.state.lock();
        state.places.clear();
        state.full_listing = None;
        state.frequent = None;
    }

    pub fn is_full_listing_valid(&self) -> bool {
        let now = self.clock.now();
        self.state
            .lock()
            .full_listing
            .as_ref()
            .map(|entry| entry.is_valid(now))
            .unwrap_or(false)
    }

    pub fn full_listing(&self) -> Option<Arc<Vec<Place>>> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .full_listing
            .as_ref()
            .filter(|entry| entry.is_valid(now))
            .map(|entry| Arc::clone(&entry.value))
    }

    pub fn set_full_listing(&self, places: Vec<Place>) -> Arc<Vec<Place>> {
        let expires_at = self.clock.now() + self.ttl;
        let listing = Arc::new(places);
        let mut state = self.state.lock();
        for place in listing.iter() {
            state.places.insert(
                place.id.clone(),
                Expiring {
                    value: place.clone(),
                    expires_at,
                },
            );
        }
        state.full_listing = Some(Expiring {
            value: Arc::clone(&listing),
            expires_at,
        });
        listing
    }

    pub fn frequent_places(&self) -> Option<Arc<Vec<FrequentPlace>>> {
        self.state.lock().frequent.clone()
    }

    pub fn set_frequent_places(&self, places: Vec<FrequentPlace>) -> Arc<Vec<FrequentPlace>> {
        let list = Arc::new(places);
        self.state.lock().frequent = Some(Arc::clone(&list));
        list
    }

    pub fn take_dirty(&self) -> Vec<VariableSnapshot> {
        let mut state = self.state.lock();
        let dirty = std::mem::take(&mut state.dirty);
        let mut snapshots: Vec<VariableSnapshot> = dirty
            .iter()
            .filter_map(|id| state.variables.get(id).cloned())
            .collect();
        snapshots.sort_by(|a, b| a.place_id.cmp(&b.place_id));
        snapshots
    }

    pub fn mark_dirty<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock();
        for id in ids {
            let id = id.into();
            if state.variables.contains_key(&id) {
                state.dirty.insert(id);
            }
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let state = self.state.lock();
        CacheStats {
            cached_places: state.places.len(),
            live_places: state.places.values().filter(|e| e.is_valid(now)).count(),
            variable_entries: state.variables.len(),
            dirty_entries: state.dirty.len(),
            full_listing_valid: state
                .full_listing
                .as_ref()
                .map(|entry| entry.is_valid(now))
                .unwrap_or(false),
            frequent_cached: state.frequent.is_some(),
        }
    }
}

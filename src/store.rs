use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::trace;

use crate::errors::{AppError, AppResult};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, key: &str) -> AppResult<bool>;
    /// Fails with [`AppError::NotFound`] when nothing is stored under `key`.
    async fn read(&self, key: &str) -> AppResult<Vec<u8>>;
    async fn write(&self, key: &str, bytes: Vec<u8>) -> AppResult<()>;
}

pub mod keys {
    use super::*;

    pub const BASE_PLACES: &str = "data/base_places.json";
    pub const FREQUENCY: &str = "data/frequency.json";
    pub const FREQUENT_PLACES: &str = "data/frequent_places.json";

    pub fn place_details(id: &str) -> String {
        format!("data/place_details/{}.json", sanitize_path_component(id))
    }

    pub fn variable_data(date: NaiveDate, id: &str) -> String {
        format!(
            "data/variable_data/{}/{}.json",
            partition(date),
            sanitize_path_component(id)
        )
    }

    pub fn congestion(date: NaiveDate, id: &str) -> String {
        format!("kto/{}/{}.json", partition(date), sanitize_path_component(id))
    }

    pub fn partition(date: NaiveDate) -> String {
        date.format("%y%m%d").to_string()
    }
}

pub fn sanitize_path_component(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '\\' | '/' | '?' | ':' | '*' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    let trimmed = replaced.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

pub async fn read_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> AppResult<T> {
    let bytes = store.read(key).await?;
    serde_json::from_slice(&bytes)
        .map_err(|err| AppError::Integrity(format!("`{key}` does not match expected shape: {err}")))
}

pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.write(key, bytes).await
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> AppResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> AppResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(AppError::Config(format!("invalid store key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, key: &str) -> AppResult<bool> {
        let path = self.resolve(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn read(&self, key: &str) -> AppResult<Vec<u8>> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(AppError::not_found(key)),
            Err(err) => Err(AppError::Io(err)),
        }
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> AppResult<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, &bytes).await?;
        fs::rename(&staging, &path).await?;
        trace!(target: "store", key, bytes = bytes.len(), "blob written");
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    reads: Mutex<HashMap<String, usize>>,
    writes: Mutex<HashMap<String, usize>>,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        self.insert_raw(key, bytes);
    }

    pub fn insert_raw(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.inner.blobs.lock().insert(key.to_string(), bytes.into());
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let blobs = self.inner.blobs.lock();
        blobs
            .get(key)
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.blobs.lock().contains_key(key)
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .blobs
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn read_count(&self, key: &str) -> usize {
        self.inner.reads.lock().get(key).copied().unwrap_or(0)
    }

    pub fn write_count(&self, key: &str) -> usize {
        self.inner.writes.lock().get(key).copied().unwrap_or(0)
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.inner.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn simulated_outage(operation: &str, key: &str) -> AppError {
    AppError::Io(io::Error::new(
        io::ErrorKind::ConnectionReset,
        format!("simulated store outage during {operation} of {key}"),
    ))
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, key: &str) -> AppResult<bool> {
        Ok(self.contains(key))
    }

    async fn read(&self, key: &str) -> AppResult<Vec<u8>> {
        *self.inner.reads.lock().entry(key.to_string()).or_default() += 1;
        if Self::take_failure(&self.inner.failing_reads) {
            return Err(simulated_outage("read", key));
        }
        self.inner
            .blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::not_found(key))
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> AppResult<()> {
        *self.inner.writes.lock().entry(key.to_string()).or_default() += 1;
        if Self::take_failure(&self.inner.failing_writes) {
            return Err(simulated_outage("write", key));
        }
        self.inner.blobs.lock().insert(key.to_string(), bytes);
        Ok(())
    }
}

#[derive(Clone)]
pub struct LatencyStore<S> {
    inner: S,
    latency: Duration,
}

impl<S: BlobStore> LatencyStore<S> {
    pub fn new(inner: S, latency: Duration) -> Self {
        Self { inner, latency }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for LatencyStore<S> {
    async fn exists(&self, key: &str) -> AppResult<bool> {
        tokio::time::sleep(self.latency).await;
        self.inner.exists(key).await
    }

    async fn read(&self, key: &str) -> AppResult<Vec<u8>> {
        tokio::time::sleep(self.latency).await;
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> AppResult<()> {
        tokio::time::sleep(self.latency).await;
        self.inner.write(key, bytes).await
    }
}

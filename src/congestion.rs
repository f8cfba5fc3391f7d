use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use parking_lot::Mutex;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::places::Place;
use crate::retry::RetryPolicy;
use crate::store::{keys, read_json, sanitize_path_component, write_json, BlobStore};

const RESULT_SUCCESS: &str = "0000";
const RESULT_NO_DATA: &str = "03";
const PAGE_SIZE: u32 = 1000;
const MEMO_CAPACITY: usize = 50_000;
const API_DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, PartialEq)]
pub struct CongestionQuery {
    pub area_code: String,
    pub district_code: String,
    pub name_filter: Option<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CongestionObservation {
    pub place: String,
    pub date: NaiveDate,
    pub rate: Option<f64>,
}

/// Persisted per-(date, place) record. `congestion_rate: None` means "no data".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CongestionRecord {
    pub date: String,
    pub place_id: String,
    pub congestion_rate: Option<f64>,
}

#[async_trait]
pub trait CongestionApi: Send + Sync {
    /// A "no data" answer from the API is an empty batch, not an error.
    async fn fetch(&self, query: &CongestionQuery) -> AppResult<Vec<CongestionObservation>>;
}

pub struct CongestionCache {
    store: Arc<dyn BlobStore>,
    api: Arc<dyn CongestionApi>,
    retry: RetryPolicy,
    call_timeout: Duration,
    window_days: u32,
    memo: Mutex<HashMap<(NaiveDate, String), Option<f64>>>,
    pending: Mutex<JoinSet<()>>,
    api_calls: AtomicU64,
    directory: Mutex<PlaceDirectory>,
}

#[derive(Default)]
struct PlaceDirectory {
    by_name: HashMap<(String, String), String>,
    ids: HashSet<String>,
}

impl CongestionCache {
    pub fn new(
        store: Arc<dyn BlobStore>,
        api: Arc<dyn CongestionApi>,
        retry: RetryPolicy,
        call_timeout: Duration,
        window_days: u32,
    ) -> Self {
        Self {
            store,
            api,
            retry,
            call_timeout,
            window_days: window_days.max(1),
            memo: Mutex::new(HashMap::new()),
            pending: Mutex::new(JoinSet::new()),
            api_calls: AtomicU64::new(0),
            directory: Mutex::new(PlaceDirectory::default()),
        }
    }

    /// Batch rows are matched to these places by (district code, name) so they
    /// land under the place id a later lookup will use.
    pub fn index_places(&self, places: &[Place]) {
        let mut directory = PlaceDirectory::default();
        for place in places {
            directory.ids.insert(place.id.clone());
            if let Some(district) = &place.district_code {
                directory
                    .by_name
                    .insert((district.clone(), place.name.trim().to_string()), place.id.clone());
            }
        }
        *self.directory.lock() = directory;
    }

    pub fn api_calls(&self) -> u64 {
        self.api_calls.load(Ordering::SeqCst)
    }

    pub async fn get(&self, date: NaiveDate, place: &Place) -> Option<f64> {
        match self.fetch(date, place).await {
            Ok(rate) => rate,
            Err(err) => {
                warn!(target: "congestion", ?err, place_id = %place.id, %date, "congestion lookup failed");
                None
            }
        }
    }

    pub async fn fetch(&self, date: NaiveDate, place: &Place) -> AppResult<Option<f64>> {
        let memoized = self.memo.lock().get(&(date, place.id.clone())).copied();
        if let Some(rate) = memoized {
            trace!(target: "congestion", place_id = %place.id, %date, "memo hit");
            return Ok(rate);
        }

        if let Some(record) = self.load_persisted(date, &place.id).await {
            self.remember(date, &place.id, record.congestion_rate);
            return Ok(record.congestion_rate);
        }

        let query = build_query(date, place, self.window_days)?;
        let batch = self.call_api(&query).await?;
        debug!(
            target: "congestion",
            place_id = %place.id,
            %date,
            records = batch.len(),
            "congestion batch fetched"
        );

        let mut requested = None;
        for observation in batch {
            let place_id = self.resolve_place_id(&observation.place, place, &query.district_code);
            if observation.date == date && place_id == place.id {
                requested = Some(observation.rate);
            }
            self.remember(observation.date, &place_id, observation.rate);
            self.persist_in_background(observation.date, CongestionRecord {
                date: observation.date.format(API_DATE_FORMAT).to_string(),
                place_id,
                congestion_rate: observation.rate,
            });
        }

        match requested {
            Some(rate) => Ok(rate),
            None => {
                self.remember(date, &place.id, None);
                self.persist_in_background(date, CongestionRecord {
                    date: date.format(API_DATE_FORMAT).to_string(),
                    place_id: place.id.clone(),
                    congestion_rate: None,
                });
                Ok(None)
            }
        }
    }

    pub async fn settle(&self) {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        while let Some(result) = pending.join_next().await {
            if let Err(err) = result {
                warn!(target: "congestion", ?err, "congestion persist task aborted");
            }
        }
    }

    async fn load_persisted(&self, date: NaiveDate, place_id: &str) -> Option<CongestionRecord> {
        let key = keys::congestion(date, place_id);
        let store = self.store.as_ref();
        match self
            .retry
            .execute("congestion_load", || read_json::<CongestionRecord>(store, &key))
            .await
        {
            Ok(record) => Some(record),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                warn!(target: "congestion", ?err, key = %key, "unreadable congestion record; refetching");
                None
            }
        }
    }

    async fn call_api(&self, query: &CongestionQuery) -> AppResult<Vec<CongestionObservation>> {
        let api = self.api.as_ref();
        let limit = self.call_timeout;
        self.retry
            .execute("congestion_fetch", || {
                self.api_calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match timeout(limit, api.fetch(query)).await {
                        Ok(result) => result,
                        Err(_) => Err(AppError::Timeout(limit)),
                    }
                }
            })
            .await
    }

    fn resolve_place_id(&self, reported: &str, requested: &Place, district: &str) -> String {
        let reported = reported.trim();
        if reported == requested.id || reported == requested.name.trim() {
            return requested.id.clone();
        }
        let directory = self.directory.lock();
        if directory.ids.contains(reported) {
            return reported.to_string();
        }
        match directory
            .by_name
            .get(&(district.to_string(), reported.to_string()))
        {
            Some(id) => id.clone(),
            None => sanitize_path_component(reported),
        }
    }

    fn remember(&self, date: NaiveDate, place_id: &str, rate: Option<f64>) {
        let mut memo = self.memo.lock();
        if memo.len() >= MEMO_CAPACITY {
            memo.clear();
        }
        memo.insert((date, place_id.to_string()), rate);
    }

    fn persist_in_background(&self, date: NaiveDate, record: CongestionRecord) {
        let key = keys::congestion(date, &record.place_id);
        let store = Arc::clone(&self.store);
        let retry = self.retry.clone();
        let mut pending = self.pending.lock();
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            if let Err(err) = retry
                .execute("congestion_persist", || write_json(store.as_ref(), &key, &record))
                .await
            {
                warn!(target: "congestion", ?err, key = %key, "failed to persist congestion record");
            }
        });
    }
}

fn build_query(date: NaiveDate, place: &Place, window_days: u32) -> AppResult<CongestionQuery> {
    let (Some(area_code), Some(district_code)) = (&place.area_code, &place.district_code) else {
        return Err(AppError::Integrity(format!(
            "place `{}` has no area/district code for congestion lookup",
            place.id
        )));
    };
    let end = date
        .checked_add_days(Days::new(u64::from(window_days.saturating_sub(1))))
        .unwrap_or(date);
    Ok(CongestionQuery {
        area_code: area_code.clone(),
        district_code: district_code.clone(),
        name_filter: Some(place.name.clone()),
        start: date,
        end,
    })
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / f64::from(safe_qps)).ceil() as u64;
        Self {
            min_interval: Duration::from_millis(interval_ms.max(50)),
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

pub struct HttpCongestionClient {
    http: Client,
    endpoint: String,
    service_key: SecretString,
    rate_limiter: RateLimiter,
}

impl HttpCongestionClient {
    pub fn new(
        endpoint: impl Into<String>,
        service_key: SecretString,
        request_timeout: Duration,
        qps: u32,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("placewatch/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            service_key,
            rate_limiter: RateLimiter::new(qps),
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Option<Self>> {
        let Some(key) = config.congestion_api_key.clone() else {
            return Ok(None);
        };
        Self::new(
            config.congestion_api_base.clone(),
            key,
            config.congestion_timeout(),
            config.congestion_rate_limit_qps,
        )
        .map(Some)
    }
}

#[async_trait]
impl CongestionApi for HttpCongestionClient {
    async fn fetch(&self, query: &CongestionQuery) -> AppResult<Vec<CongestionObservation>> {
        #[derive(Deserialize)]
        struct Envelope {
            response: ResponseBody,
        }

        #[derive(Deserialize)]
        struct ResponseBody {
            header: Header,
            #[serde(default)]
            body: Option<Body>,
        }

        #[derive(Deserialize)]
        struct Header {
            #[serde(rename = "resultCode")]
            result_code: String,
            #[serde(rename = "resultMsg", default)]
            result_msg: String,
        }

        #[derive(Deserialize)]
        struct Body {
            #[serde(default)]
            items: Value,
        }

        #[derive(Deserialize)]
        struct Item {
            #[serde(rename = "baseYmd")]
            base_ymd: String,
            #[serde(rename = "tAtsNm")]
            name: String,
            #[serde(rename = "cnctrRate", default)]
            rate: Value,
        }

        let mut params: Vec<(&str, String)> = vec![
            ("serviceKey", self.service_key.expose_secret().to_string()),
            ("numOfRows", PAGE_SIZE.to_string()),
            ("pageNo", "1".into()),
            ("MobileOS", "ETC".into()),
            ("MobileApp", "placewatch".into()),
            ("_type", "json".into()),
            ("areaCd", query.area_code.clone()),
            ("signguCd", query.district_code.clone()),
        ];
        if let Some(name) = &query.name_filter {
            params.push(("tAtsNm", name.clone()));
        }

        self.rate_limiter.wait().await;
        let response = self
            .http
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        let envelope: Envelope = response.json().await?;
        let header = envelope.response.header;

        if header.result_code == RESULT_NO_DATA {
            return Ok(Vec::new());
        }
        if header.result_code != RESULT_SUCCESS {
            return Err(AppError::Upstream {
                code: header.result_code,
                message: header.result_msg,
            });
        }

        let items = envelope
            .response
            .body
            .map(|body| body.items)
            .unwrap_or(Value::Null);
        let raw_items = match items {
            Value::Object(mut map) => match map.remove("item") {
                Some(Value::Array(list)) => list,
                Some(single @ Value::Object(_)) => vec![single],
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        let mut observations = Vec::with_capacity(raw_items.len());
        for raw in raw_items {
            let item: Item = serde_json::from_value(raw)?;
            let Ok(date) = NaiveDate::parse_from_str(item.base_ymd.trim(), API_DATE_FORMAT) else {
                warn!(target: "congestion", base_ymd = %item.base_ymd, "skipping record with unparsable date");
                continue;
            };
            if date < query.start || date > query.end {
                continue;
            }
            observations.push(CongestionObservation {
                place: item.name,
                date,
                rate: parse_rate(&item.rate),
            });
        }
        Ok(observations)
    }
}

fn parse_rate(value: &Value) -> Option<f64> {
    let rate = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (!rate.is_nan()).then_some(rate)
}

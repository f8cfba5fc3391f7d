use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub search_keywords: Vec<String>,
    #[serde(default)]
    pub area_code: Option<String>,
    #[serde(default)]
    pub district_code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Place {
    pub fn validate(&self) -> AppResult<()> {
        if self.id.trim().is_empty() {
            return Err(AppError::Integrity("place record has an empty id".into()));
        }
        if self.name.trim().is_empty() {
            return Err(AppError::Integrity(format!(
                "place `{}` has an empty name",
                self.id
            )));
        }
        Ok(())
    }

    pub fn matches_query(&self, needle: &str) -> bool {
        text_matches(&self.name, &self.location, &self.search_keywords, needle)
    }
}

fn text_matches(name: &str, location: &str, keywords: &[String], needle: &str) -> bool {
    let needle = needle.to_lowercase();
    name.to_lowercase().contains(&needle)
        || location.to_lowercase().contains(&needle)
        || keywords
            .iter()
            .any(|keyword| keyword.to_lowercase().contains(&needle))
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "place id must be a string or number, got {other}"
        ))),
    }
}

pub fn parse_place_collection(key: &str, bytes: &[u8]) -> AppResult<Vec<Place>> {
    let document: Value = serde_json::from_slice(bytes)
        .map_err(|err| AppError::Integrity(format!("`{key}` is not valid JSON: {err}")))?;
    let Value::Array(records) = document else {
        return Err(AppError::Integrity(format!(
            "`{key}` must contain an array of places"
        )));
    };

    let total = records.len();
    let places: Vec<Place> = records
        .into_iter()
        .filter_map(|record| serde_json::from_value::<Place>(record).ok())
        .filter(|place| place.validate().is_ok())
        .collect();
    if places.len() < total {
        debug!(
            target: "places",
            key,
            skipped = total - places.len(),
            "ignored structurally invalid place records"
        );
    }
    Ok(places)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Weather {
    pub condition: String,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub precipitation_chance: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableSnapshot {
    pub place_id: String,
    pub crowd: u32,
    pub weather: Weather,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableUpdate {
    pub crowd: u32,
    pub weather: Weather,
}

impl VariableUpdate {
    pub fn validate(&self) -> AppResult<()> {
        if self.weather.condition.trim().is_empty() {
            return Err(AppError::Integrity("weather condition is required".into()));
        }
        Ok(())
    }

    pub fn stamp(self, place_id: &str, now: DateTime<Utc>) -> VariableSnapshot {
        VariableSnapshot {
            place_id: place_id.to_string(),
            crowd: self.crowd,
            weather: self.weather,
            last_updated: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequentPlace {
    pub id: String,
    pub name: String,
    pub address: String,
    pub location: String,
    pub search_keywords: Vec<String>,
    pub area_code: Option<String>,
    pub district_code: Option<String>,
    pub frequency: u64,
}

impl FrequentPlace {
    pub fn project(place: &Place, frequency: u64) -> Self {
        Self {
            id: place.id.clone(),
            name: place.name.clone(),
            address: place.address.clone(),
            location: place.location.clone(),
            search_keywords: place.search_keywords.clone(),
            area_code: place.area_code.clone(),
            district_code: place.district_code.clone(),
            frequency,
        }
    }

    pub fn matches_query(&self, needle: &str) -> bool {
        text_matches(&self.name, &self.location, &self.search_keywords, needle)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub name: String,
    pub location: String,
    pub frequent: bool,
    pub current_crowd: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceDetail {
    #[serde(flatten)]
    pub place: Place,
    pub details: Option<Value>,
    pub current_data: Option<VariableSnapshot>,
}

//! Client for the remote astrological database.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | ASTRO_DB_BASE_URL | (required) | API root, e.g. `https://api.example.com` |
//! | ASTRO_DB_API_KEY | unset | Sent as a bearer token when present |
//! | ASTRO_DB_TIMEOUT | 30 | Request timeout in seconds |
//! | ASTRO_DB_PEOPLE_ENDPOINT | /people | Raw people table |
//! | ASTRO_DB_CLEANED_ENDPOINT | /people/cleaned | Cleaned people table |
//! | ASTRO_DB_REDUCED_ENDPOINT | /people/reduced | Reduced people table |
//! | ASTRO_DB_FEATURES_ENDPOINT | /astro-features | Feature table |
//! | ASTRO_DB_PREPARED_ENDPOINT | /ml/prepared | Encoded training table |
//! | ASTRO_DB_FILTERS | unset | Extra query pairs sent with every request, `key=value&key=value` |

use crate::error::{ConfigError, DataError, DataResult};
use crate::features::Row;
use crate::sources::{DataSource, Resource};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// Keys under which a wrapped payload may carry its record list.
const LIST_KEYS: [&str; 4] = ["results", "data", "items", "records"];

/// Paths of each remote table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub people: String,
    pub cleaned: String,
    pub reduced: String,
    pub features: String,
    pub prepared: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            people: "/people".into(),
            cleaned: "/people/cleaned".into(),
            reduced: "/people/reduced".into(),
            features: "/astro-features".into(),
            prepared: "/ml/prepared".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSourceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub endpoints: Endpoints,
    pub filters: Vec<(String, String)>,
}

/// `key=value` pairs joined by `&`; `None` when a pair has no key or no `=`.
fn parse_filters(raw: &str) -> Option<Vec<(String, String)>> {
    raw.split('&')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}

impl RemoteSourceConfig {
    /// Reads the `ASTRO_DB_*` settings through `lookup`, usually `std::env::var`. A missing
    /// base URL or an unparseable timeout is a configuration error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let base_url = non_empty("ASTRO_DB_BASE_URL").ok_or(ConfigError::Missing("ASTRO_DB_BASE_URL"))?;
        let timeout = match non_empty("ASTRO_DB_TIMEOUT") {
            None => Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .map(Duration::from_secs_f64)
                .ok_or(ConfigError::Invalid {
                    key: "ASTRO_DB_TIMEOUT",
                    value: raw,
                })?,
        };

        let filters = match non_empty("ASTRO_DB_FILTERS") {
            None => Vec::new(),
            Some(raw) => parse_filters(&raw).ok_or(ConfigError::Invalid {
                key: "ASTRO_DB_FILTERS",
                value: raw,
            })?,
        };

        let defaults = Endpoints::default();
        let endpoint = |key: &str, default: String| non_empty(key).unwrap_or(default);
        Ok(Self {
            base_url,
            api_key: non_empty("ASTRO_DB_API_KEY"),
            timeout,
            endpoints: Endpoints {
                people: endpoint("ASTRO_DB_PEOPLE_ENDPOINT", defaults.people),
                cleaned: endpoint("ASTRO_DB_CLEANED_ENDPOINT", defaults.cleaned),
                reduced: endpoint("ASTRO_DB_REDUCED_ENDPOINT", defaults.reduced),
                features: endpoint("ASTRO_DB_FEATURES_ENDPOINT", defaults.features),
                prepared: endpoint("ASTRO_DB_PREPARED_ENDPOINT", defaults.prepared),
            },
            filters,
        })
    }

    pub fn endpoint(&self, resource: Resource) -> &str {
        match resource {
            Resource::People => &self.endpoints.people,
            Resource::CleanedPeople => &self.endpoints.cleaned,
            Resource::ReducedPeople => &self.endpoints.reduced,
            Resource::Features => &self.endpoints.features,
            Resource::Prepared => &self.endpoints.prepared,
        }
    }
}

/// HTTP data source. Single attempt per call, bounded by the configured timeout.
pub struct RemoteSource {
    config: RemoteSourceConfig,
    client: reqwest::Client,
    limit: Option<usize>,
}

impl RemoteSource {
    pub fn new(config: RemoteSourceConfig) -> DataResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DataError::Unavailable {
                source_name: config.base_url.clone(),
                reason: format!("HTTP client init failed: {}", e),
            })?;
        Ok(Self {
            config,
            client,
            limit: None,
        })
    }

    /// Sends `limit` with every request.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn url(&self, resource: Resource) -> DataResult<Url> {
        let raw = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.endpoint(resource).trim_start_matches('/')
        );
        let mut url = Url::parse(&raw).map_err(|e| DataError::Unavailable {
            source_name: raw.clone(),
            reason: format!("invalid URL: {}", e),
        })?;
        if self.limit.is_some() || !self.config.filters.is_empty() {
            let mut query = url.query_pairs_mut();
            if let Some(limit) = self.limit {
                query.append_pair("limit", &limit.to_string());
            }
            for (k, v) in &self.config.filters {
                query.append_pair(k, v);
            }
        }
        Ok(url)
    }
}

/// Pulls the record list out of a bare-list or wrapped payload.
pub fn extract_records(payload: Value, source_name: &str) -> DataResult<Vec<Row>> {
    let list = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => LIST_KEYS
            .iter()
            .find_map(|k| match map.remove(*k) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| DataError::Malformed {
                source_name: source_name.to_string(),
                reason: "expected a list of records".into(),
            })?,
        other => {
            return Err(DataError::Malformed {
                source_name: source_name.to_string(),
                reason: format!("expected a list of records, got {}", kind_of(&other)),
            })
        }
    };

    list.into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(row) => Ok(row),
            other => Err(DataError::Malformed {
                source_name: source_name.to_string(),
                reason: format!("record {i} is {} instead of an object", kind_of(&other)),
            }),
        })
        .collect()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl DataSource for RemoteSource {
    fn name(&self) -> String {
        format!("remote {}", self.config.base_url)
    }

    async fn fetch(&self, resource: Resource) -> DataResult<Vec<Row>> {
        let url = self.url(resource)?;
        let source_name = url.to_string();
        tracing::debug!(target: "natal::data", url = %source_name, "querying remote database");

        let mut request = self
            .client
            .get(url)
            .header("Accept", "application/json");
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let res = request.send().await.map_err(|e| DataError::Unavailable {
            source_name: source_name.clone(),
            reason: format!("request failed: {}", e),
        })?;
        if !res.status().is_success() {
            return Err(DataError::Unavailable {
                source_name,
                reason: format!("HTTP {}", res.status()),
            });
        }
        let payload: Value = res.json().await.map_err(|e| DataError::Malformed {
            source_name: source_name.clone(),
            reason: format!("response parse failed: {}", e),
        })?;

        let rows = extract_records(payload, &source_name)?;
        tracing::info!(target: "natal::data", url = %source_name, records = rows.len(), "remote records received");
        Ok(rows)
    }
}

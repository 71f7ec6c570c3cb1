//! Feature-service adapter: builds the perimeter query, fetches it and decodes
//! the `features` array into [`RawFeature`] records.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use fireperim_core::{RawFeature, ATTR_DATE_CURRENT};
use fireperim_storage::{is_transient_code, FetchError, HttpClient};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fireperim-adapters";

pub const DEFAULT_ENDPOINT: &str = "https://services1.arcgis.com/jUJYIo9tSA7EHvfZ/ArcGIS/rest/services/CA_Perimeters_NIFC_FIRIS_public_view/FeatureServer/0/query";

pub const DEFAULT_SOURCES: [&str; 3] = ["CAL FIRE INTEL FLIGHT DATA", "FIRIS", "USFS"];

pub const DEFAULT_LOOKBACK_DAYS: u32 = 3;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("response body is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feature service error {code}: {message}")]
    Service { code: i64, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// Worth another attempt within the same cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Fetch(err) => err.is_transient(),
            AdapterError::Service { code, .. } => {
                u16::try_from(*code).is_ok_and(is_transient_code)
            }
            _ => false,
        }
    }
}

/// Per-cycle inputs to a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    /// Local calendar date at cycle start; the lookback is counted from here.
    pub today: NaiveDate,
}

/// Result of the infallible fetch: no features plus the reason on failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub features: Vec<RawFeature>,
    pub failure: Option<String>,
}

#[async_trait]
pub trait FeatureSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_features(&self, ctx: &FetchContext) -> Result<Vec<RawFeature>, AdapterError>;

    /// Never fails: any error is logged and yields an empty feature list.
    async fn fetch(&self, ctx: &FetchContext) -> FetchOutcome {
        match self.fetch_features(ctx).await {
            Ok(features) => FetchOutcome {
                features,
                failure: None,
            },
            Err(err) => {
                warn!(
                    source = self.source_id(),
                    run_id = %ctx.run_id,
                    error = %err,
                    "error fetching fire data"
                );
                FetchOutcome {
                    features: Vec::new(),
                    failure: Some(err.to_string()),
                }
            }
        }
    }
}

/// Waits between attempts of one fetch: `first_wait`, doubling per retry,
/// capped at `max_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub retries: u32,
    pub first_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            retries: 3,
            first_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(10),
        }
    }
}

impl RetrySchedule {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn waits(self) -> impl Iterator<Item = Duration> {
        (0..self.retries).map(move |retry| {
            self.first_wait
                .saturating_mul(2u32.saturating_pow(retry))
                .min(self.max_wait)
        })
    }
}

/// Query against the perimeter layer: source allow-list plus a rolling date
/// lower bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerimeterQuery {
    pub endpoint: String,
    pub sources: Vec<String>,
    pub lookback_days: u32,
}

impl Default for PerimeterQuery {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            sources: DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect(),
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl PerimeterQuery {
    pub fn lower_bound(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(self.lookback_days)))
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn where_clause(&self, today: NaiveDate) -> String {
        let date_filter = format!(
            "{ATTR_DATE_CURRENT} >= date '{}'",
            self.lower_bound(today).format("%Y-%m-%d")
        );
        if self.sources.is_empty() {
            return date_filter;
        }
        let sources = self
            .sources
            .iter()
            .map(|s| format!("source={}", sql_quote(s)))
            .collect::<Vec<_>>()
            .join(" OR ");
        format!("({sources}) AND {date_filter}")
    }

    pub fn url_for(&self, today: NaiveDate) -> Result<String, AdapterError> {
        let where_clause = self.where_clause(today);
        let params = [
            ("where", where_clause.as_str()),
            ("geometryType", "esriGeometryEnvelope"),
            ("spatialRel", "esriSpatialRelIntersects"),
            ("outFields", "*"),
            ("returnGeometry", "true"),
            ("returnExceededLimitFeatures", "true"),
            ("f", "json"),
        ];
        reqwest::Url::parse_with_params(&self.endpoint, params)
            .map(|url| url.to_string())
            .map_err(|e| AdapterError::Message(format!("invalid endpoint {}: {e}", self.endpoint)))
    }
}

/// Decoded query response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeatures {
    pub features: Vec<RawFeature>,
    /// Array elements that did not decode as a feature.
    pub skipped: usize,
}

/// Decode a query response body. A missing or non-array `features` member
/// yields no features; an `error` envelope is a failure.
pub fn parse_query_response(body: &[u8]) -> Result<ParsedFeatures, AdapterError> {
    let json: JsonValue = serde_json::from_slice(body)?;

    if let Some(error) = json.get("error") {
        return Err(AdapterError::Service {
            code: error.get("code").and_then(JsonValue::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }

    let Some(items) = json.get("features").and_then(JsonValue::as_array) else {
        warn!("response has no features array");
        return Ok(ParsedFeatures::default());
    };

    let mut parsed = ParsedFeatures::default();
    for item in items {
        match serde_json::from_value::<RawFeature>(item.clone()) {
            Ok(feature) => parsed.features.push(feature),
            Err(err) => {
                warn!(error = %err, "skipping undecodable feature");
                parsed.skipped += 1;
            }
        }
    }
    Ok(parsed)
}

/// Load a saved query response from disk.
pub fn load_response_file(path: impl AsRef<Path>) -> anyhow::Result<ParsedFeatures> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_query_response(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Live fetcher for the perimeter layer. Transient failures (throttling,
/// 5xx statuses or `error` envelopes, connect timeouts) are retried on the
/// [`RetrySchedule`]; anything else fails the fetch immediately.
#[derive(Debug, Clone)]
pub struct FeatureFetcher {
    query: PerimeterQuery,
    http: HttpClient,
    retry: RetrySchedule,
}

impl FeatureFetcher {
    pub fn new(query: PerimeterQuery, http: HttpClient) -> Self {
        Self {
            query,
            http,
            retry: RetrySchedule::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetrySchedule) -> Self {
        self.retry = retry;
        self
    }

    async fn attempt(&self, url: &str) -> Result<ParsedFeatures, AdapterError> {
        let body = self.http.get(url).await?;
        parse_query_response(&body)
    }
}

#[async_trait]
impl FeatureSource for FeatureFetcher {
    fn source_id(&self) -> &str {
        &self.query.endpoint
    }

    async fn fetch_features(&self, ctx: &FetchContext) -> Result<Vec<RawFeature>, AdapterError> {
        let url = self.query.url_for(ctx.today)?;
        let mut waits = self.retry.waits();
        let mut attempt = 1u32;

        let parsed = loop {
            let span = info_span!("http_fetch", run_id = %ctx.run_id, attempt);
            let err = match self.attempt(&url).instrument(span).await {
                Ok(parsed) => break parsed,
                Err(err) => err,
            };
            let Some(wait) = waits.next().filter(|_| err.is_transient()) else {
                return Err(err);
            };
            warn!(
                run_id = %ctx.run_id,
                attempt,
                ?wait,
                error = %err,
                "transient feature service failure"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        };

        info!(
            run_id = %ctx.run_id,
            attempts = attempt,
            fetched = parsed.features.len(),
            skipped = parsed.skipped,
            "fetched features"
        );
        Ok(parsed.features)
    }
}

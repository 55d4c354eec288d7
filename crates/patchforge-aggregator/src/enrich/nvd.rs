//! NVD CVE 2.0 API client.
//!
//! Single-CVE lookups with a sliding-window rate limiter (5 requests per
//! 30s without an API key, 50 with one). A 429 sleeps out the window and
//! retries exactly once before surfacing failure. All calls run behind
//! the `nvd-api` circuit breaker with retry on transient errors.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use patchforge_resilience::{
    get_circuit_breaker, retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, CircuitError,
    RetryPolicy,
};

use crate::enrich::CveMetadataSource;
use crate::error::EnrichError;

const NVD_BASE_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";
const RATE_WINDOW: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Authoritative CVE metadata extracted from an NVD response.
#[derive(Debug, Clone, PartialEq)]
pub struct NvdRecord {
    pub cve_id: String,
    pub description: Option<String>,
    pub cvss_score: Option<f64>,
    pub cvss_vector: Option<String>,
    pub cwe_ids: Vec<String>,
    pub references: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct NvdResponse {
    #[serde(default)]
    vulnerabilities: Vec<NvdVulnerability>,
}

#[derive(Debug, Deserialize)]
struct NvdVulnerability {
    cve: NvdCveItem,
}

#[derive(Debug, Deserialize)]
struct NvdCveItem {
    id: String,
    #[serde(default)]
    descriptions: Vec<NvdLangValue>,
    #[serde(default)]
    metrics: NvdMetrics,
    #[serde(default)]
    references: Vec<NvdReference>,
    #[serde(default)]
    weaknesses: Vec<NvdWeakness>,
    published: Option<String>,
    #[serde(rename = "lastModified")]
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NvdLangValue {
    lang: String,
    value: String,
}

#[derive(Debug, Deserialize, Default)]
struct NvdMetrics {
    #[serde(rename = "cvssMetricV31", default)]
    v31: Vec<NvdMetric>,
    #[serde(rename = "cvssMetricV30", default)]
    v30: Vec<NvdMetric>,
    #[serde(rename = "cvssMetricV2", default)]
    v2: Vec<NvdMetric>,
}

#[derive(Debug, Deserialize)]
struct NvdMetric {
    #[serde(rename = "cvssData")]
    cvss_data: NvdCvssData,
}

#[derive(Debug, Deserialize)]
struct NvdCvssData {
    #[serde(rename = "baseScore")]
    base_score: f64,
    #[serde(rename = "vectorString")]
    vector_string: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NvdReference {
    url: String,
}

#[derive(Debug, Deserialize)]
struct NvdWeakness {
    #[serde(default)]
    description: Vec<NvdLangValue>,
}

/// Client for the NVD CVE 2.0 API.
pub struct NvdClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    rate_limit: usize,
    request_log: Mutex<VecDeque<std::time::Instant>>,
    breaker: Arc<CircuitBreaker>,
}

impl NvdClient {
    pub fn new(api_key: Option<String>) -> Self {
        let rate_limit = if api_key.is_some() { 50 } else { 5 };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            base_url: NVD_BASE_URL.to_string(),
            api_key,
            client,
            rate_limit,
            request_log: Mutex::new(VecDeque::new()),
            breaker: get_circuit_breaker("nvd-api", CircuitBreakerConfig::default()),
        }
    }

    /// Point the client at a different endpoint (local stubs in tests).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    /// Sliding-window rate limiter: blocks until a request slot frees up.
    async fn throttle(&self) {
        let mut log = self.request_log.lock().await;
        let now = std::time::Instant::now();

        while let Some(front) = log.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() >= self.rate_limit {
            let oldest = *log.front().expect("log is non-empty at capacity");
            let wait = RATE_WINDOW.saturating_sub(now.duration_since(oldest));
            debug!("nvd rate limit reached, sleeping {:.1}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;

            let now = std::time::Instant::now();
            while let Some(front) = log.front() {
                if now.duration_since(*front) >= RATE_WINDOW {
                    log.pop_front();
                } else {
                    break;
                }
            }
        }

        log.push_back(std::time::Instant::now());
    }

    /// One request against the API. On 429, sleeps out the rate window
    /// and retries exactly once.
    async fn fetch_once(&self, cve_id: &str) -> Result<Option<NvdRecord>, EnrichError> {
        for attempt in 0..2 {
            self.throttle().await;

            let mut request = self.client.get(&self.base_url).query(&[("cveId", cve_id)]);
            if let Some(key) = &self.api_key {
                request = request.header("apiKey", key);
            }

            let response = request.send().await?;
            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if attempt == 0 {
                    warn!("nvd returned 429, sleeping out the rate window");
                    tokio::time::sleep(RATE_WINDOW).await;
                    continue;
                }
                return Err(EnrichError::RateLimited {
                    service: "nvd".to_string(),
                });
            }

            if status == reqwest::StatusCode::NOT_FOUND {
                debug!("cve {} not found in nvd", cve_id);
                return Ok(None);
            }

            if !status.is_success() {
                return Err(EnrichError::Api {
                    service: "nvd".to_string(),
                    status: status.as_u16(),
                });
            }

            let body: NvdResponse = response.json().await?;
            return Ok(parse_nvd_response(body));
        }

        Err(EnrichError::RateLimited {
            service: "nvd".to_string(),
        })
    }
}

#[async_trait]
impl CveMetadataSource for NvdClient {
    async fn cve_details(&self, cve_id: &str) -> Result<Option<NvdRecord>, EnrichError> {
        let policy = RetryPolicy::api_call();
        let result = self
            .breaker
            .call(|| {
                retry_with_backoff(&policy, EnrichError::is_retryable, || {
                    self.fetch_once(cve_id)
                })
            })
            .await;

        match result {
            Ok(record) => Ok(record),
            Err(CircuitError::Open { name, .. }) => Err(EnrichError::CircuitOpen(name)),
            Err(CircuitError::Inner(exhausted)) => Err(exhausted.source),
        }
    }
}

/// Extract a record from a parsed NVD response, preferring CVSS v3.1 over
/// v3.0 over v2.
fn parse_nvd_response(body: NvdResponse) -> Option<NvdRecord> {
    let item = body.vulnerabilities.into_iter().next()?.cve;

    let metric = item
        .metrics
        .v31
        .first()
        .or_else(|| item.metrics.v30.first())
        .or_else(|| item.metrics.v2.first());

    let description = item
        .descriptions
        .iter()
        .find(|d| d.lang == "en")
        .or_else(|| item.descriptions.first())
        .map(|d| d.value.clone());

    let cwe_ids = item
        .weaknesses
        .iter()
        .flat_map(|w| w.description.iter())
        .filter(|d| d.lang == "en")
        .map(|d| d.value.clone())
        .collect();

    Some(NvdRecord {
        cve_id: item.id,
        description,
        cvss_score: metric.map(|m| m.cvss_data.base_score),
        cvss_vector: metric.and_then(|m| m.cvss_data.vector_string.clone()),
        cwe_ids,
        references: item.references.into_iter().map(|r| r.url).collect(),
        published_at: item.published.as_deref().and_then(parse_nvd_timestamp),
        last_modified_at: item.last_modified.as_deref().and_then(parse_nvd_timestamp),
    })
}

/// NVD timestamps come without a timezone suffix ("2024-01-15T10:00:00.000");
/// treat them as UTC. RFC 3339 inputs are accepted too.
fn parse_nvd_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.3f")
        .ok()
        .map(|naive| naive.and_utc())
}

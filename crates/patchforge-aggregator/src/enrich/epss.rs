//! EPSS API client.
//!
//! Fetches exploit-prediction scores from FIRST.org. Supports single and
//! bulk lookups (the bulk endpoint caps out around 30 CVEs per request).
//! EPSS publishes scores as decimal strings; both string and numeric
//! payloads are accepted.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use patchforge_resilience::{
    get_circuit_breaker, retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, CircuitError,
    RetryPolicy,
};

use crate::enrich::EpssSource;
use crate::error::EnrichError;

const EPSS_BASE_URL: &str = "https://api.first.org/data/v1/epss";
const BULK_BATCH_SIZE: usize = 30;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// EPSS score for one CVE.
#[derive(Debug, Clone, PartialEq)]
pub struct EpssScore {
    pub cve_id: String,
    /// Probability of exploitation within 30 days, in [0, 1].
    pub score: f64,
    /// Percentile among all scored CVEs, in [0, 1].
    pub percentile: f64,
    pub date: Option<String>,
}

impl EpssScore {
    /// Coarse interpretation band used in log lines.
    pub fn risk_band(&self) -> &'static str {
        if self.score >= 0.5 {
            "very_high"
        } else if self.score >= 0.3 {
            "high"
        } else if self.score >= 0.1 {
            "medium"
        } else if self.score >= 0.01 {
            "low"
        } else {
            "very_low"
        }
    }
}

#[derive(Debug, Deserialize)]
struct EpssResponse {
    #[serde(default)]
    data: Vec<EpssItem>,
}

#[derive(Debug, Deserialize)]
struct EpssItem {
    cve: String,
    epss: serde_json::Value,
    percentile: serde_json::Value,
    date: Option<String>,
}

/// Client for the FIRST.org EPSS API.
pub struct EpssClient {
    base_url: String,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl Default for EpssClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EpssClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            base_url: EPSS_BASE_URL.to_string(),
            client,
            breaker: get_circuit_breaker("epss-api", CircuitBreakerConfig::default()),
        }
    }

    /// Point the client at a different endpoint (local stubs in tests).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    async fn fetch_once(&self, cve_param: &str) -> Result<Vec<EpssScore>, EnrichError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("cve", cve_param)])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EnrichError::RateLimited {
                service: "epss".to_string(),
            });
        }
        if !status.is_success() {
            return Err(EnrichError::Api {
                service: "epss".to_string(),
                status: status.as_u16(),
            });
        }

        let body: EpssResponse = response.json().await?;
        Ok(parse_epss_items(body.data))
    }

    async fn fetch_guarded(&self, cve_param: &str) -> Result<Vec<EpssScore>, EnrichError> {
        let policy = RetryPolicy::api_call();
        let result = self
            .breaker
            .call(|| {
                retry_with_backoff(&policy, EnrichError::is_retryable, || {
                    self.fetch_once(cve_param)
                })
            })
            .await;

        match result {
            Ok(scores) => Ok(scores),
            Err(CircuitError::Open { name, .. }) => Err(EnrichError::CircuitOpen(name)),
            Err(CircuitError::Inner(exhausted)) => Err(exhausted.source),
        }
    }

    /// Fetch scores for many CVEs, batched under the API's bulk cap.
    pub async fn bulk_scores(
        &self,
        cve_ids: &[String],
    ) -> Result<HashMap<String, EpssScore>, EnrichError> {
        let mut results = HashMap::new();

        for batch in cve_ids.chunks(BULK_BATCH_SIZE) {
            let param = batch.join(",");
            for score in self.fetch_guarded(&param).await? {
                results.insert(score.cve_id.clone(), score);
            }
        }

        Ok(results)
    }
}

#[async_trait]
impl EpssSource for EpssClient {
    async fn epss_score(&self, cve_id: &str) -> Result<Option<EpssScore>, EnrichError> {
        let scores = self.fetch_guarded(cve_id).await?;
        let score = scores.into_iter().find(|s| s.cve_id == cve_id);
        if score.is_none() {
            debug!("no epss data for {}", cve_id);
        }
        Ok(score)
    }
}

/// EPSS encodes scores as strings ("0.97543"); accept numbers too.
fn lenient_f64(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn parse_epss_items(items: Vec<EpssItem>) -> Vec<EpssScore> {
    items
        .into_iter()
        .filter_map(|item| {
            Some(EpssScore {
                score: lenient_f64(&item.epss)?,
                percentile: lenient_f64(&item.percentile)?,
                cve_id: item.cve,
                date: item.date,
            })
        })
        .collect()
}

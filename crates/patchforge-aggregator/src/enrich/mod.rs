//! Finding enrichment.
//!
//! Augments findings with authoritative data from NVD, EPSS and the
//! exploit catalog. Lookups for one finding run concurrently and each
//! source is allowed to fail independently: a dead enrichment service
//! costs fields, never records.

pub mod epss;
pub mod exploits;
pub mod nvd;

pub use epss::{EpssClient, EpssScore};
pub use exploits::{ExploitCatalog, ExploitEvidence, KevStubCatalog};
pub use nvd::{NvdClient, NvdRecord};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use patchforge_core::{EnrichedFinding, ExploitMaturity, RawFinding, Settings};
use patchforge_resilience::{get_bulkhead, Bulkhead};

use crate::cache::EnrichmentCache;
use crate::error::EnrichError;

static CVE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^CVE-\d{4}-\d+$").expect("cve pattern is valid"));

/// Source of authoritative CVE metadata (NVD or a test double).
#[async_trait]
pub trait CveMetadataSource: Send + Sync {
    async fn cve_details(&self, cve_id: &str) -> Result<Option<NvdRecord>, EnrichError>;
}

/// Source of EPSS exploitation probabilities.
#[async_trait]
pub trait EpssSource: Send + Sync {
    async fn epss_score(&self, cve_id: &str) -> Result<Option<EpssScore>, EnrichError>;
}

/// The data-only portion of an enrichment, cached per CVE id and applied
/// to any finding that carries that CVE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Enrichment {
    pub cvss_score: Option<f64>,
    pub cvss_vector: Option<String>,
    pub cwe_ids: Vec<String>,
    pub epss_score: Option<f64>,
    pub epss_percentile: Option<f64>,
    pub exploit_available: bool,
    pub exploit_maturity: ExploitMaturity,
    pub in_kev: bool,
    pub references: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl Enrichment {
    /// Attach this enrichment to a raw finding.
    pub fn apply(&self, finding: RawFinding) -> EnrichedFinding {
        let mut enriched = EnrichedFinding::unenriched(finding);
        if self.cvss_score.is_some() {
            enriched.cvss_score = self.cvss_score;
        }
        if self.cvss_vector.is_some() {
            enriched.cvss_vector = self.cvss_vector.clone();
        }
        enriched.cwe_ids = self.cwe_ids.clone();
        enriched.epss_score = self.epss_score;
        enriched.epss_percentile = self.epss_percentile;
        enriched.exploit_available = self.exploit_available;
        enriched.exploit_maturity = self.exploit_maturity;
        enriched.in_kev = self.in_kev;
        enriched.references = self.references.clone();
        enriched.published_at = self.published_at;
        enriched.last_modified_at = self.last_modified_at;
        enriched
    }
}

/// Orchestrates enrichment against all external sources.
pub struct EnrichmentService {
    nvd: Arc<dyn CveMetadataSource>,
    epss: Arc<dyn EpssSource>,
    exploits: Arc<dyn ExploitCatalog>,
    cache: EnrichmentCache,
    bulkhead: Arc<Bulkhead>,
}

impl EnrichmentService {
    /// Build the service with live NVD / EPSS clients from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            nvd: Arc::new(NvdClient::new(settings.nvd_api_key.clone())),
            epss: Arc::new(EpssClient::new()),
            exploits: Arc::new(KevStubCatalog),
            cache: EnrichmentCache::new(Duration::from_secs(settings.cache_ttl_hours * 3600)),
            bulkhead: get_bulkhead("enrichment", settings.enrich_concurrency, None),
        }
    }

    /// Build the service with explicit sources; used by tests.
    pub fn with_sources(
        nvd: Arc<dyn CveMetadataSource>,
        epss: Arc<dyn EpssSource>,
        exploits: Arc<dyn ExploitCatalog>,
        cache_ttl: Duration,
        bulkhead: Arc<Bulkhead>,
    ) -> Self {
        Self {
            nvd,
            epss,
            exploits,
            cache: EnrichmentCache::new(cache_ttl),
            bulkhead,
        }
    }

    /// Enrich a single finding. Never fails: when no CVE id is present,
    /// the id is malformed, or every source is down, the finding comes
    /// back unenriched.
    pub async fn enrich(&self, finding: RawFinding) -> EnrichedFinding {
        let cve_id = match finding.cve_id.as_deref() {
            Some(cve) if CVE_PATTERN.is_match(cve) => cve.to_string(),
            Some(other) => {
                debug!("skipping enrichment for malformed CVE id '{}'", other);
                return EnrichedFinding::unenriched(finding);
            }
            None => return EnrichedFinding::unenriched(finding),
        };

        if let Some(cached) = self.cache.get(&cve_id) {
            return cached.apply(finding);
        }

        info!("enriching {}", cve_id);

        let (nvd_result, epss_result, exploit_result) = tokio::join!(
            self.nvd.cve_details(&cve_id),
            self.epss.epss_score(&cve_id),
            self.exploits.check(&cve_id),
        );

        let nvd = unwrap_source("nvd", &cve_id, nvd_result);
        let epss = unwrap_source("epss", &cve_id, epss_result);
        let exploit = unwrap_source("exploit-catalog", &cve_id, exploit_result.map(Some));

        let mut enrichment = Enrichment::default();
        if let Some(record) = nvd {
            enrichment.cvss_score = record.cvss_score;
            enrichment.cvss_vector = record.cvss_vector;
            enrichment.cwe_ids = record.cwe_ids;
            enrichment.references = record.references;
            enrichment.published_at = record.published_at;
            enrichment.last_modified_at = record.last_modified_at;
        }
        if let Some(score) = epss {
            enrichment.epss_score = Some(score.score);
            enrichment.epss_percentile = Some(score.percentile);
        }
        if let Some(evidence) = exploit {
            enrichment.exploit_available = evidence.available;
            enrichment.exploit_maturity = evidence.maturity;
            enrichment.in_kev = evidence.in_kev;
        }

        self.cache.insert(&cve_id, enrichment.clone());
        enrichment.apply(finding)
    }

    /// Enrich a batch under the enrichment bulkhead. Order is preserved.
    /// A bulkhead rejection skips enrichment for that finding.
    pub async fn enrich_batch(&self, findings: Vec<RawFinding>) -> Vec<EnrichedFinding> {
        let tasks = findings.into_iter().map(|finding| async {
            match self.bulkhead.acquire().await {
                Ok(_permit) => self.enrich(finding).await,
                Err(rejected) => {
                    warn!("{}; emitting unenriched finding", rejected);
                    EnrichedFinding::unenriched(finding)
                }
            }
        });

        futures::future::join_all(tasks).await
    }
}

/// Collapse a source result to an option, logging the failure mode.
/// A breaker-open outcome is an expected degradation, not an error.
fn unwrap_source<T>(
    service: &str,
    cve_id: &str,
    result: Result<Option<T>, EnrichError>,
) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(EnrichError::CircuitOpen(name)) => {
            warn!("{} breaker '{}' open, skipping for {}", service, name, cve_id);
            None
        }
        Err(err) => {
            warn!("{} enrichment failed for {}: {}", service, cve_id, err);
            None
        }
    }
}

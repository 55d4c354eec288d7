//! The scan cycle: fan-out fetch, dedup, enrich, score, persist.
//!
//! Scanner failures are isolated per source; one unreachable scanner
//! costs its own findings, never the cycle. Raw findings keep each
//! scanner's own ordering; across scanners no order is guaranteed.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use patchforge_core::{
    priority_score, EnrichedFinding, FindingStore, PriorityWeights, RawFinding,
};

use crate::adapter::ScannerAdapter;
use crate::dedup::Deduplicator;
use crate::enrich::EnrichmentService;

/// Outcome of one scanner source within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Success { findings: usize },
    Failed { error: String },
}

/// Summary of one scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCycleReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub sources: BTreeMap<String, SourceOutcome>,
    /// Raw findings before deduplication.
    pub total_raw: usize,
    /// Unique findings after deduplication.
    pub unique: usize,
    /// Findings successfully handed to persistence.
    pub stored: usize,
}

/// Ingestion pipeline driving adapters through to the persistence facade.
pub struct ScanPipeline {
    adapters: Vec<Arc<dyn ScannerAdapter>>,
    dedup: Deduplicator,
    enricher: EnrichmentService,
    store: Arc<dyn FindingStore>,
    weights: PriorityWeights,
    /// Total asset count hint for the exposure component; when zero, the
    /// fleet is estimated from the assets seen in the cycle itself.
    fleet_size: usize,
    last_cycle: RwLock<Vec<EnrichedFinding>>,
}

impl ScanPipeline {
    pub fn new(
        adapters: Vec<Arc<dyn ScannerAdapter>>,
        enricher: EnrichmentService,
        store: Arc<dyn FindingStore>,
    ) -> Self {
        Self {
            adapters,
            dedup: Deduplicator::new(),
            enricher,
            store,
            weights: PriorityWeights::default(),
            fleet_size: 0,
            last_cycle: RwLock::new(Vec::new()),
        }
    }

    pub fn with_fleet_size(mut self, fleet_size: usize) -> Self {
        self.fleet_size = fleet_size;
        self
    }

    pub fn with_weights(mut self, weights: PriorityWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Run one full scan cycle.
    pub async fn run_scan_cycle(&self, since: Option<DateTime<Utc>>) -> ScanCycleReport {
        let started_at = Utc::now();
        info!("starting scan cycle across {} source(s)", self.adapters.len());

        let fetches = self.adapters.iter().map(|adapter| {
            let adapter = Arc::clone(adapter);
            async move {
                let name = adapter.name().to_string();
                let result = adapter.fetch_findings(since, None).await;
                (name, result)
            }
        });

        let mut sources = BTreeMap::new();
        let mut raw_findings: Vec<RawFinding> = Vec::new();

        for (name, result) in join_all(fetches).await {
            match result {
                Ok(findings) => {
                    info!("{} returned {} finding(s)", name, findings.len());
                    sources.insert(
                        name,
                        SourceOutcome::Success {
                            findings: findings.len(),
                        },
                    );
                    raw_findings.extend(findings);
                }
                Err(err) => {
                    warn!("scanner {} failed, continuing cycle: {}", name, err);
                    sources.insert(
                        name,
                        SourceOutcome::Failed {
                            error: err.to_string(),
                        },
                    );
                }
            }
        }

        let total_raw = raw_findings.len();
        raw_findings.retain(|finding| match finding.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!("dropping malformed finding: {}", err);
                false
            }
        });
        let unique_findings = self.dedup.dedup(raw_findings);
        let unique = unique_findings.len();

        let mut enriched = self.enricher.enrich_batch(unique_findings).await;

        let fleet = self.effective_fleet_size(&enriched);
        for finding in enriched.iter_mut() {
            finding.priority_score = priority_score(finding, fleet, &self.weights);
        }

        let mut stored = 0usize;
        for finding in &enriched {
            match self.store.upsert_finding(finding.clone()).await {
                Ok(()) => stored += 1,
                Err(err) => {
                    error!(
                        "failed to persist finding {}: {}",
                        finding.finding.cve_id.as_deref().unwrap_or("no-cve"),
                        err
                    );
                }
            }
        }

        *self.last_cycle.write().await = enriched;

        let report = ScanCycleReport {
            started_at,
            completed_at: Utc::now(),
            sources,
            total_raw,
            unique,
            stored,
        };
        info!(
            "scan cycle complete: {} raw, {} unique, {} stored",
            report.total_raw, report.unique, report.stored
        );
        report
    }

    /// Re-enrich one stored finding by CVE id. Returns the refreshed
    /// finding, or `None` when the CVE is unknown to the store.
    pub async fn enrich_finding(
        &self,
        cve_id: &str,
    ) -> patchforge_core::Result<Option<EnrichedFinding>> {
        let Some(existing) = self.store.find_finding_by_cve(cve_id).await? else {
            return Ok(None);
        };

        let mut refreshed = self.enricher.enrich(existing.finding).await;
        let fleet = self.effective_fleet_size(std::slice::from_ref(&refreshed));
        refreshed.priority_score = priority_score(&refreshed, fleet, &self.weights);

        self.store.upsert_finding(refreshed.clone()).await?;
        Ok(Some(refreshed))
    }

    /// Re-score everything from the last cycle and persist the new
    /// scores. Returns the number of findings rescored.
    pub async fn recompute_priorities(&self) -> patchforge_core::Result<usize> {
        let mut findings = self.last_cycle.write().await;
        let fleet = self.effective_fleet_size(&findings);

        for finding in findings.iter_mut() {
            finding.priority_score = priority_score(finding, fleet, &self.weights);
            self.store.upsert_finding(finding.clone()).await?;
        }

        Ok(findings.len())
    }

    fn effective_fleet_size(&self, findings: &[EnrichedFinding]) -> usize {
        if self.fleet_size > 0 {
            return self.fleet_size;
        }
        let assets: BTreeSet<&String> = findings
            .iter()
            .flat_map(|f| f.finding.affected_assets.iter())
            .collect();
        assets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::{
        CveMetadataSource, EpssScore, EpssSource, KevStubCatalog, NvdRecord,
    };
    use crate::error::ScannerError;
    use crate::scanners::MockAdapter;
    use async_trait::async_trait;
    use patchforge_core::{MemoryStore, Severity};
    use patchforge_resilience::Bulkhead;
    use std::time::Duration;

    struct NullNvd;

    #[async_trait]
    impl CveMetadataSource for NullNvd {
        async fn cve_details(&self, _cve: &str) -> Result<Option<NvdRecord>, crate::EnrichError> {
            Ok(None)
        }
    }

    struct NullEpss;

    #[async_trait]
    impl EpssSource for NullEpss {
        async fn epss_score(&self, _cve: &str) -> Result<Option<EpssScore>, crate::EnrichError> {
            Ok(None)
        }
    }

    struct BrokenAdapter;

    #[async_trait]
    impl ScannerAdapter for BrokenAdapter {
        fn name(&self) -> &str {
            "Broken"
        }

        async fn authenticate(&self) -> Result<(), ScannerError> {
            Err(ScannerError::auth("Broken", "always down"))
        }

        async fn fetch_findings(
            &self,
            _since: Option<DateTime<Utc>>,
            _filter: Option<&[Severity]>,
        ) -> Result<Vec<RawFinding>, ScannerError> {
            Err(ScannerError::fetch("Broken", "connection refused"))
        }

        async fn get_asset_details(
            &self,
            asset_id: &str,
        ) -> Result<serde_json::Value, ScannerError> {
            Err(ScannerError::AssetNotFound(asset_id.to_string()))
        }
    }

    fn test_enricher() -> EnrichmentService {
        EnrichmentService::with_sources(
            Arc::new(NullNvd),
            Arc::new(NullEpss),
            Arc::new(KevStubCatalog),
            Duration::from_secs(3600),
            Arc::new(Bulkhead::new("test-pipeline-enrich", 5, None)),
        )
    }

    #[tokio::test]
    async fn test_cycle_with_mock_adapter_stores_findings() {
        let store = MemoryStore::shared();
        let pipeline = ScanPipeline::new(
            vec![Arc::new(MockAdapter::new(8).with_seed(11))],
            test_enricher(),
            store.clone(),
        );

        let report = pipeline.run_scan_cycle(None).await;
        assert_eq!(report.sources.len(), 1);
        assert!(matches!(
            report.sources["Mock"],
            SourceOutcome::Success { .. }
        ));
        assert_eq!(report.total_raw, 8);
        assert!(report.unique <= report.total_raw);
        assert_eq!(report.stored, report.unique);
        assert_eq!(store.finding_count().await, report.unique);
    }

    #[tokio::test]
    async fn test_broken_scanner_does_not_break_cycle() {
        let store = MemoryStore::shared();
        let pipeline = ScanPipeline::new(
            vec![
                Arc::new(BrokenAdapter),
                Arc::new(MockAdapter::new(5).with_seed(12)),
            ],
            test_enricher(),
            store.clone(),
        );

        let report = pipeline.run_scan_cycle(None).await;
        assert!(matches!(
            report.sources["Broken"],
            SourceOutcome::Failed { .. }
        ));
        assert!(matches!(
            report.sources["Mock"],
            SourceOutcome::Success { .. }
        ));
        assert!(report.stored > 0, "healthy scanner's findings still land");
    }

    #[tokio::test]
    async fn test_priority_scores_are_populated() {
        let store = MemoryStore::shared();
        let pipeline = ScanPipeline::new(
            vec![Arc::new(MockAdapter::new(6).with_seed(13))],
            test_enricher(),
            store.clone(),
        )
        .with_fleet_size(100);

        pipeline.run_scan_cycle(None).await;

        let last = pipeline.last_cycle.read().await;
        assert!(last.iter().all(|f| f.priority_score > 0.0));
    }

    #[tokio::test]
    async fn test_enrich_finding_unknown_cve_is_none() {
        let pipeline = ScanPipeline::new(vec![], test_enricher(), MemoryStore::shared());
        let result = pipeline.enrich_finding("CVE-1999-0000").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_recompute_priorities_counts_last_cycle() {
        let pipeline = ScanPipeline::new(
            vec![Arc::new(MockAdapter::new(4).with_seed(14))],
            test_enricher(),
            MemoryStore::shared(),
        );

        let report = pipeline.run_scan_cycle(None).await;
        let rescored = pipeline.recompute_priorities().await.unwrap();
        assert_eq!(rescored, report.unique);
    }
}

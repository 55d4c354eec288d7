//! Uniform scanner contract.
//!
//! Every vulnerability source is driven through [`ScannerAdapter`].
//! Adapters are safe to call concurrently; each one serializes its own
//! authentication state internally so parallel callers never race a
//! token refresh.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use patchforge_core::{RawFinding, ScannerSourceConfig, Severity};

use crate::error::ScannerError;
use crate::scanners::{MockAdapter, WazuhAdapter};

/// Uniform contract over vulnerability scanners.
#[async_trait]
pub trait ScannerAdapter: Send + Sync {
    /// Stable adapter name used in logs and merged scanner fields.
    fn name(&self) -> &str;

    /// Authenticate with the scanner. Idempotent; adapters may cache a
    /// session token with their own TTL.
    async fn authenticate(&self) -> Result<(), ScannerError>;

    /// Fetch the scanner's findings, optionally restricted to those
    /// discovered after `since` or matching the severity filter. Filters
    /// are applied server-side when the scanner supports it, client-side
    /// otherwise. Order follows the scanner's own ordering.
    async fn fetch_findings(
        &self,
        since: Option<DateTime<Utc>>,
        severity_filter: Option<&[Severity]>,
    ) -> Result<Vec<RawFinding>, ScannerError>;

    /// Fetch an opaque descriptor for one asset.
    async fn get_asset_details(&self, asset_id: &str) -> Result<serde_json::Value, ScannerError>;

    /// Whether the scanner is reachable and credentials work.
    async fn health_check(&self) -> bool {
        self.authenticate().await.is_ok()
    }

    /// Map a scanner-specific severity string onto the canonical scale.
    fn normalize_severity(&self, raw: &str) -> Severity {
        Severity::from_scanner_str(raw)
    }
}

/// Instantiate adapters from the configured source list.
///
/// Unknown type keys are skipped with a warning rather than failing the
/// whole registry; a misconfigured source must not take down the cycle.
pub fn build_adapters(sources: &[ScannerSourceConfig]) -> Vec<Arc<dyn ScannerAdapter>> {
    let mut adapters: Vec<Arc<dyn ScannerAdapter>> = Vec::new();

    for source in sources {
        match source.kind.as_str() {
            "wazuh" => adapters.push(Arc::new(WazuhAdapter::new(source.clone()))),
            "mock" => adapters.push(Arc::new(MockAdapter::new(10))),
            other => {
                tracing::warn!("skipping scanner source with unknown kind '{}'", other);
            }
        }
    }

    info!("built {} scanner adapter(s)", adapters.len());
    adapters
}

//! Deterministic mock scanner for tests and local development.
//!
//! Generates a synthetic finding inventory from a fixed seed: the same
//! seed always yields the same findings, which keeps pipeline tests
//! stable while still exercising a spread of severities and packages.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

use patchforge_core::{RawFinding, Severity};

use crate::adapter::ScannerAdapter;
use crate::error::ScannerError;

const SCANNER_NAME: &str = "Mock";
const PACKAGES: [&str; 5] = ["openssl", "apache2", "nginx", "postgresql", "redis"];
const SEVERITIES: [Severity; 4] = [
    Severity::Critical,
    Severity::High,
    Severity::Medium,
    Severity::Low,
];

/// Synthetic scanner adapter.
pub struct MockAdapter {
    num_findings: usize,
    seed: u64,
}

impl MockAdapter {
    pub fn new(num_findings: usize) -> Self {
        Self {
            num_findings,
            seed: 42,
        }
    }

    /// Fix the RNG seed so repeated fetches return identical findings.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn cvss_for(severity: Severity, rng: &mut StdRng) -> f64 {
        let (min, max) = match severity {
            Severity::Critical => (9.0, 10.0),
            Severity::High => (7.0, 8.9),
            Severity::Medium => (4.0, 6.9),
            Severity::Low => (0.1, 3.9),
            Severity::Info => (0.0, 0.0),
        };
        (rng.gen_range(min..=max) * 10.0_f64).round() / 10.0
    }

    fn generate(&self) -> Vec<RawFinding> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let now = Utc::now();
        let mut findings = Vec::with_capacity(self.num_findings);

        for i in 0..self.num_findings {
            let severity = SEVERITIES[rng.gen_range(0..SEVERITIES.len())];
            let package = PACKAGES[rng.gen_range(0..PACKAGES.len())];
            let age_days = rng.gen_range(1..=30);
            let discovered_at = now - ChronoDuration::days(age_days);
            let asset_count = rng.gen_range(1..=5);

            findings.push(RawFinding {
                scanner_id: format!("mock-{i}"),
                scanner_name: SCANNER_NAME.to_string(),
                cve_id: Some(format!("CVE-2024-{}", 1000 + i)),
                title: format!("Mock {severity} vulnerability in {package}"),
                description: Some(format!(
                    "Synthetic {severity} vulnerability in {package} for testing"
                )),
                severity,
                cvss_score: Some(Self::cvss_for(severity, &mut rng)),
                cvss_vector: Some("CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H".to_string()),
                affected_package: Some(package.to_string()),
                vulnerable_version: Some("1.0.0".to_string()),
                fixed_version: Some("1.0.1".to_string()),
                affected_assets: (0..asset_count)
                    .map(|j| format!("mock-asset-{j}"))
                    .collect::<BTreeSet<_>>(),
                discovered_at,
                raw_data: serde_json::json!({"mock": true, "index": i}),
            });
        }

        findings
    }
}

#[async_trait]
impl ScannerAdapter for MockAdapter {
    fn name(&self) -> &str {
        SCANNER_NAME
    }

    async fn authenticate(&self) -> Result<(), ScannerError> {
        Ok(())
    }

    async fn fetch_findings(
        &self,
        since: Option<DateTime<Utc>>,
        severity_filter: Option<&[Severity]>,
    ) -> Result<Vec<RawFinding>, ScannerError> {
        let findings = self
            .generate()
            .into_iter()
            .filter(|f| since.map(|s| f.discovered_at >= s).unwrap_or(true))
            .filter(|f| {
                severity_filter
                    .map(|filter| filter.contains(&f.severity))
                    .unwrap_or(true)
            })
            .collect();

        Ok(findings)
    }

    async fn get_asset_details(&self, asset_id: &str) -> Result<serde_json::Value, ScannerError> {
        Ok(serde_json::json!({
            "id": asset_id,
            "name": format!("Mock Asset {asset_id}"),
            "type": "server",
            "os": "Ubuntu 22.04",
            "ip": "192.168.1.10",
        }))
    }
}

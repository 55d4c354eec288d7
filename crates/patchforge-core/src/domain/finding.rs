//! Vulnerability finding records.
//!
//! `RawFinding` is what a scanner adapter emits; it is never mutated after
//! creation. The deduplicator consumes raw findings and emits merged
//! copies. `EnrichedFinding` is a raw finding augmented with authoritative
//! data from NVD, EPSS and the exploit catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Canonical five-level severity scale.
///
/// Variants are declared in ascending rank so the derived ordering puts
/// `Critical` highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Normalize a scanner-specific severity string to the canonical scale.
    ///
    /// Covers the common textual levels plus CVSS-range strings such as
    /// `"9.0-10.0"`. Unknown inputs map to `Medium`.
    pub fn from_scanner_str(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" => Severity::Low,
            "info" | "informational" | "none" => Severity::Info,
            "9.0-10.0" => Severity::Critical,
            "7.0-8.9" => Severity::High,
            "4.0-6.9" => Severity::Medium,
            "0.1-3.9" => Severity::Low,
            _ => Severity::Medium,
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maturity of publicly known exploit code for a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExploitMaturity {
    #[default]
    None,
    Poc,
    Functional,
    Weaponized,
}

/// A single vulnerability-on-asset record as reported by one scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    /// Opaque per-source identifier assigned by the scanner.
    pub scanner_id: String,
    /// Name of the scanner that produced this record.
    pub scanner_name: String,
    /// CVE identifier when the scanner could attribute one.
    pub cve_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    /// CVSS base score in [0, 10] when the scanner supplied one.
    pub cvss_score: Option<f64>,
    pub cvss_vector: Option<String>,
    pub affected_package: Option<String>,
    pub vulnerable_version: Option<String>,
    pub fixed_version: Option<String>,
    /// Identifiers of the assets this finding was observed on.
    pub affected_assets: BTreeSet<String>,
    pub discovered_at: DateTime<Utc>,
    /// Scanner payload carried through verbatim for forensic reference.
    pub raw_data: serde_json::Value,
}

impl RawFinding {
    /// Validate the numeric invariants on a finding.
    pub fn validate(&self) -> super::Result<()> {
        if let Some(score) = self.cvss_score {
            if !(0.0..=10.0).contains(&score) {
                return Err(super::CoreError::InvalidFinding(format!(
                    "cvss score {score} out of range for {}",
                    self.scanner_id
                )));
            }
        }
        Ok(())
    }
}

/// A raw finding augmented with authoritative external data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedFinding {
    pub finding: RawFinding,
    /// Authoritative CVSS from NVD; may override the scanner-supplied score.
    pub cvss_score: Option<f64>,
    pub cvss_vector: Option<String>,
    /// CWE identifiers (e.g. "CWE-79").
    pub cwe_ids: Vec<String>,
    /// EPSS exploitation probability in [0, 1].
    pub epss_score: Option<f64>,
    /// EPSS percentile in [0, 1].
    pub epss_percentile: Option<f64>,
    pub exploit_available: bool,
    pub exploit_maturity: ExploitMaturity,
    /// Whether the CVE appears in the known-exploited catalog.
    pub in_kev: bool,
    pub references: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
    /// Aggregated priority score in [0, 100]; ordering only.
    pub priority_score: f64,
}

impl EnrichedFinding {
    /// Wrap a raw finding with no enrichment data attached.
    ///
    /// Used when the finding has no CVE id, the CVE id is malformed, or
    /// every enrichment source was unavailable.
    pub fn unenriched(finding: RawFinding) -> Self {
        let cvss_score = finding.cvss_score;
        let cvss_vector = finding.cvss_vector.clone();
        Self {
            finding,
            cvss_score,
            cvss_vector,
            cwe_ids: Vec::new(),
            epss_score: None,
            epss_percentile: None,
            exploit_available: false,
            exploit_maturity: ExploitMaturity::None,
            in_kev: false,
            references: Vec::new(),
            published_at: None,
            last_modified_at: None,
            priority_score: 0.0,
        }
    }

    /// Effective CVSS: authoritative when present, else the scanner's.
    pub fn effective_cvss(&self) -> Option<f64> {
        self.cvss_score.or(self.finding.cvss_score)
    }
}

//! Deduplication of findings across scanners and scan runs.
//!
//! Findings are keyed by `(cve_id, affected_package)`. On collision the
//! existing record is merged with the new one: asset sets union, CVSS and
//! severity take the maximum, and descriptive fields prefer the
//! first-seen value. Because of that preference, scanner ordering affects
//! the tie-breaker fields (description, fixed version, CVSS vector) but
//! never the safety-critical ones (CVSS score, severity, asset set).
//! Output preserves first-seen insertion order.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

use patchforge_core::RawFinding;

/// Collapses duplicate findings.
#[derive(Debug, Default)]
pub struct Deduplicator;

impl Deduplicator {
    pub fn new() -> Self {
        Self
    }

    /// Deduplicate a batch, preserving first-seen order.
    pub fn dedup(&self, findings: Vec<RawFinding>) -> Vec<RawFinding> {
        let mut ordered: Vec<RawFinding> = Vec::with_capacity(findings.len());
        let mut index: HashMap<String, usize> = HashMap::new();

        for finding in findings {
            let key = Self::dedup_key(&finding);

            match index.get(&key) {
                Some(&slot) => {
                    debug!(
                        "merging duplicate finding {} from {}",
                        finding.cve_id.as_deref().unwrap_or("no-cve"),
                        finding.scanner_name
                    );
                    let merged = Self::merge(ordered[slot].clone(), finding);
                    ordered[slot] = merged;
                }
                None => {
                    index.insert(key, ordered.len());
                    ordered.push(finding);
                }
            }
        }

        ordered
    }

    /// Dedup key: `cve:package`. Findings with neither a CVE nor a
    /// package get a stable title-hash suffix so unrelated records do not
    /// collapse into one.
    fn dedup_key(finding: &RawFinding) -> String {
        let cve = finding.cve_id.as_deref().unwrap_or("no-cve");
        let package = finding.affected_package.as_deref().unwrap_or("no-package");

        if finding.cve_id.is_none() && finding.affected_package.is_none() {
            let digest = Sha256::digest(finding.title.as_bytes());
            return format!("{cve}:{package}:{}", &hex::encode(digest)[..8]);
        }

        format!("{cve}:{package}")
    }

    /// Merge a duplicate into the existing record.
    fn merge(existing: RawFinding, new: RawFinding) -> RawFinding {
        let mut affected_assets = existing.affected_assets.clone();
        affected_assets.extend(new.affected_assets.iter().cloned());

        let cvss_score = match (existing.cvss_score, new.cvss_score) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let mut raw_data = existing.raw_data.clone();
        if let Some(bag) = raw_data.as_object_mut() {
            bag.insert(new.scanner_name.clone(), new.raw_data.clone());
        }

        RawFinding {
            scanner_id: existing.scanner_id,
            scanner_name: format!("{},{}", existing.scanner_name, new.scanner_name),
            cve_id: existing.cve_id.or(new.cve_id),
            title: existing.title,
            description: existing.description.or(new.description),
            severity: existing.severity.max(new.severity),
            cvss_score,
            cvss_vector: existing.cvss_vector.or(new.cvss_vector),
            affected_package: existing.affected_package,
            vulnerable_version: existing.vulnerable_version,
            fixed_version: existing.fixed_version.or(new.fixed_version),
            affected_assets,
            discovered_at: existing.discovered_at.max(new.discovered_at),
            raw_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use patchforge_core::Severity;
    use std::collections::BTreeSet;

    fn finding(
        scanner: &str,
        cve: Option<&str>,
        package: Option<&str>,
        severity: Severity,
        cvss: Option<f64>,
        assets: &[&str],
    ) -> RawFinding {
        RawFinding {
            scanner_id: format!("{scanner}-1"),
            scanner_name: scanner.to_string(),
            cve_id: cve.map(|s| s.to_string()),
            title: format!("Issue in {}", package.unwrap_or("system")),
            description: None,
            severity,
            cvss_score: cvss,
            cvss_vector: None,
            affected_package: package.map(|s| s.to_string()),
            vulnerable_version: None,
            fixed_version: None,
            affected_assets: assets.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            discovered_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            raw_data: serde_json::json!({"scanner": scanner}),
        }
    }

    #[test]
    fn test_merge_scenario_from_two_scanners() {
        let first = finding(
            "ScannerA",
            Some("CVE-2024-0001"),
            Some("openssl"),
            Severity::High,
            Some(7.5),
            &["a", "b"],
        );
        let second = finding(
            "ScannerB",
            Some("CVE-2024-0001"),
            Some("openssl"),
            Severity::Critical,
            Some(9.0),
            &["b", "c"],
        );

        let out = Deduplicator::new().dedup(vec![first, second]);
        assert_eq!(out.len(), 1);

        let merged = &out[0];
        assert_eq!(merged.severity, Severity::Critical);
        assert_eq!(merged.cvss_score, Some(9.0));
        let expected: BTreeSet<String> =
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(merged.affected_assets, expected);
        assert_eq!(merged.scanner_name, "ScannerA,ScannerB");
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let findings = vec![
            finding("A", Some("CVE-2024-1"), Some("nginx"), Severity::High, Some(8.0), &["x"]),
            finding("B", Some("CVE-2024-1"), Some("nginx"), Severity::Medium, Some(6.0), &["y"]),
            finding("A", Some("CVE-2024-2"), Some("redis"), Severity::Low, None, &["x"]),
        ];

        let dedup = Deduplicator::new();
        let once = dedup.dedup(findings);
        let twice = dedup.dedup(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_severity_is_monotone_under_merge() {
        let findings = vec![
            finding("A", Some("CVE-2024-1"), Some("nginx"), Severity::Critical, None, &[]),
            finding("B", Some("CVE-2024-1"), Some("nginx"), Severity::Low, None, &[]),
        ];
        let max_in = findings.iter().map(|f| f.severity).max().unwrap();
        let out = Deduplicator::new().dedup(findings);
        assert!(out[0].severity >= max_in);
    }

    #[test]
    fn test_merged_cvss_is_max_of_both() {
        let findings = vec![
            finding("A", Some("CVE-2024-1"), Some("pkg"), Severity::High, Some(6.1), &[]),
            finding("B", Some("CVE-2024-1"), Some("pkg"), Severity::High, Some(9.8), &[]),
        ];
        let out = Deduplicator::new().dedup(findings);
        assert_eq!(out[0].cvss_score, Some(9.8));
    }

    #[test]
    fn test_single_sided_cvss_survives() {
        let findings = vec![
            finding("A", Some("CVE-2024-1"), Some("pkg"), Severity::High, None, &[]),
            finding("B", Some("CVE-2024-1"), Some("pkg"), Severity::High, Some(5.0), &[]),
        ];
        let out = Deduplicator::new().dedup(findings);
        assert_eq!(out[0].cvss_score, Some(5.0));
    }

    #[test]
    fn test_first_seen_order_is_preserved() {
        let findings = vec![
            finding("A", Some("CVE-2024-3"), Some("redis"), Severity::Low, None, &[]),
            finding("A", Some("CVE-2024-1"), Some("nginx"), Severity::High, None, &[]),
            finding("B", Some("CVE-2024-3"), Some("redis"), Severity::High, None, &[]),
            finding("A", Some("CVE-2024-2"), Some("curl"), Severity::Medium, None, &[]),
        ];
        let out = Deduplicator::new().dedup(findings);
        let cves: Vec<_> = out.iter().map(|f| f.cve_id.clone().unwrap()).collect();
        assert_eq!(cves, vec!["CVE-2024-3", "CVE-2024-1", "CVE-2024-2"]);
    }

    #[test]
    fn test_no_cve_no_package_findings_do_not_merge() {
        let mut a = finding("A", None, None, Severity::Low, None, &[]);
        a.title = "Weak SSH ciphers enabled".to_string();
        let mut b = finding("B", None, None, Severity::Low, None, &[]);
        b.title = "World-readable backup directory".to_string();

        let out = Deduplicator::new().dedup(vec![a, b]);
        assert_eq!(out.len(), 2, "unrelated no-CVE findings must not collapse");
    }

    #[test]
    fn test_no_cve_same_title_findings_merge() {
        let mut a = finding("A", None, None, Severity::Low, None, &["x"]);
        a.title = "Weak SSH ciphers enabled".to_string();
        let mut b = finding("B", None, None, Severity::Medium, None, &["y"]);
        b.title = "Weak SSH ciphers enabled".to_string();

        let out = Deduplicator::new().dedup(vec![a, b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::Medium);
    }

    #[test]
    fn test_raw_data_bag_extended_with_new_scanner() {
        let findings = vec![
            finding("A", Some("CVE-2024-1"), Some("pkg"), Severity::High, None, &[]),
            finding("B", Some("CVE-2024-1"), Some("pkg"), Severity::High, None, &[]),
        ];
        let out = Deduplicator::new().dedup(findings);
        assert!(out[0].raw_data.get("B").is_some());
    }
}

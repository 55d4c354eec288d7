//! Priority scoring for enriched findings.
//!
//! The score is a pure weighted combination of risk signals and is used
//! for ordering only; it never gates a finding's progression through the
//! pipeline. Deterministic for fixed inputs.

use serde::{Deserialize, Serialize};

use crate::domain::EnrichedFinding;

/// Weights applied to each risk signal.
///
/// The defaults sum to 1.0: CVSS 0.35, EPSS 0.25, exploit availability
/// 0.20, KEV membership 0.15, fleet exposure 0.05.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub cvss: f64,
    pub epss: f64,
    pub exploit_available: f64,
    pub in_kev: f64,
    pub fleet_exposure: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            cvss: 0.35,
            epss: 0.25,
            exploit_available: 0.20,
            in_kev: 0.15,
            fleet_exposure: 0.05,
        }
    }
}

/// Compute the priority score in [0, 100] for an enriched finding.
///
/// `fleet_size` is the total number of known assets; exposure is the
/// fraction of the fleet the finding affects. Missing CVSS or EPSS
/// contribute zero rather than being imputed.
pub fn priority_score(
    finding: &EnrichedFinding,
    fleet_size: usize,
    weights: &PriorityWeights,
) -> f64 {
    let cvss_component = finding.effective_cvss().unwrap_or(0.0) / 10.0;
    let epss_component = finding.epss_score.unwrap_or(0.0);
    let exploit_component = if finding.exploit_available { 1.0 } else { 0.0 };
    let kev_component = if finding.in_kev { 1.0 } else { 0.0 };
    let exposure_component = if fleet_size > 0 {
        (finding.finding.affected_assets.len() as f64 / fleet_size as f64).min(1.0)
    } else {
        0.0
    };

    let score = cvss_component * weights.cvss
        + epss_component * weights.epss
        + exploit_component * weights.exploit_available
        + kev_component * weights.in_kev
        + exposure_component * weights.fleet_exposure;

    (score * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RawFinding, Severity};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn enriched(
        cvss: Option<f64>,
        epss: Option<f64>,
        exploit: bool,
        kev: bool,
        assets: usize,
    ) -> EnrichedFinding {
        let finding = RawFinding {
            scanner_id: "s-1".to_string(),
            scanner_name: "Mock".to_string(),
            cve_id: Some("CVE-2024-0001".to_string()),
            title: "test".to_string(),
            description: None,
            severity: Severity::High,
            cvss_score: None,
            cvss_vector: None,
            affected_package: Some("openssl".to_string()),
            vulnerable_version: None,
            fixed_version: None,
            affected_assets: (0..assets).map(|i| format!("asset-{i}")).collect::<BTreeSet<_>>(),
            discovered_at: Utc::now(),
            raw_data: serde_json::Value::Null,
        };
        let mut e = EnrichedFinding::unenriched(finding);
        e.cvss_score = cvss;
        e.epss_score = epss;
        e.exploit_available = exploit;
        e.in_kev = kev;
        e
    }

    #[test]
    fn test_maximum_signals_score_100() {
        let f = enriched(Some(10.0), Some(1.0), true, true, 10);
        let score = priority_score(&f, 10, &PriorityWeights::default());
        assert!((score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_signals_score_zero() {
        let f = enriched(None, None, false, false, 0);
        let score = priority_score(&f, 100, &PriorityWeights::default());
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_score_is_deterministic() {
        let f = enriched(Some(8.5), Some(0.85), true, false, 3);
        let w = PriorityWeights::default();
        let a = priority_score(&f, 50, &w);
        let b = priority_score(&f, 50, &w);
        assert_eq!(a, b);
    }

    #[test]
    fn test_component_arithmetic() {
        // cvss 8.0/10 * 0.35 + epss 0.5 * 0.25 + exploit 0.20 = 0.685
        let f = enriched(Some(8.0), Some(0.5), true, false, 0);
        let score = priority_score(&f, 10, &PriorityWeights::default());
        assert!((score - 68.5).abs() < 1e-9);
    }

    #[test]
    fn test_zero_fleet_contributes_no_exposure() {
        let f = enriched(None, None, false, false, 5);
        let score = priority_score(&f, 0, &PriorityWeights::default());
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_exposure_is_capped_at_fleet() {
        // More affected assets than the fleet hint still caps at 1.0.
        let f = enriched(None, None, false, false, 20);
        let score = priority_score(&f, 10, &PriorityWeights::default());
        assert!((score - 5.0).abs() < 1e-9);
    }
}

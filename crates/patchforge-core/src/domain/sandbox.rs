//! Sandbox test records: captured system state, state diffs, health
//! checks, and the final test result emitted by the harness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::asset::PackageManager;

/// Final status of a sandbox test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Errored,
    Skipped,
}

/// Captured output of one script execution inside the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Metadata of one sentinel file, used for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub size: u64,
    pub mtime: i64,
}

/// Snapshot of observable system state inside a sandbox container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SystemState {
    pub captured_at: Option<DateTime<Utc>>,
    /// Package name -> installed version.
    pub packages: BTreeMap<String, String>,
    /// Service name -> state (e.g. "running").
    pub services: BTreeMap<String, String>,
    /// Sentinel file path -> (size, mtime).
    pub files: BTreeMap<String, FileMeta>,
    /// Interface name -> addresses.
    pub interfaces: BTreeMap<String, Vec<String>>,
    pub listening_ports: Vec<String>,
    /// Process listing, capped at 50 lines.
    pub processes: Vec<String>,
    /// Parsed /etc/os-release key/value pairs.
    pub os_release: BTreeMap<String, String>,
    pub kernel: Option<String>,
    pub memory_total_mb: Option<u64>,
    pub package_manager: Option<PackageManager>,
}

/// One package that changed version between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChange {
    pub package: String,
    pub before_version: String,
    pub after_version: String,
}

/// Structured difference between two [`SystemState`] snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StateDiff {
    /// Package name -> version, present only after the patch.
    pub added_packages: BTreeMap<String, String>,
    /// Package name -> version, present only before the patch.
    pub removed_packages: BTreeMap<String, String>,
    pub updated_packages: Vec<PackageChange>,
    pub started_services: Vec<String>,
    pub stopped_services: Vec<String>,
    /// Sentinel files whose (size, mtime) changed.
    pub modified_files: Vec<String>,
    pub interfaces_changed: bool,
    pub listening_ports_changed: bool,
    pub has_changes: bool,
}

/// Result of one health check inside the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: serde_json::Value,
}

impl HealthCheckResult {
    pub fn new(name: impl Into<String>, passed: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Aggregate outcome of a health-check suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HealthReport {
    pub results: Vec<HealthCheckResult>,
    /// passed / total, as a percentage.
    pub success_rate: f64,
    /// True when the success rate meets the 70% threshold.
    pub overall_passed: bool,
}

impl HealthReport {
    /// Aggregate individual check results; overall pass requires >= 70%.
    pub fn from_results(results: Vec<HealthCheckResult>) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        let success_rate = if total > 0 {
            passed as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            results,
            success_rate,
            overall_passed: success_rate >= 70.0,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn total_count(&self) -> usize {
        self.results.len()
    }
}

/// Complete record of one sandbox rehearsal of a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxTest {
    pub test_id: String,
    pub patch_id: String,
    pub asset_id: String,
    /// Container image key the sandbox was provisioned from.
    pub image: String,
    pub state_before: SystemState,
    pub execution: ExecutionResult,
    pub state_after: SystemState,
    pub state_diff: StateDiff,
    pub health: HealthReport,
    pub container_logs: String,
    pub status: TestStatus,
    /// Confidence in [0, 100].
    pub confidence: f64,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_report_threshold() {
        let results = vec![
            HealthCheckResult::new("a", true, "ok"),
            HealthCheckResult::new("b", true, "ok"),
            HealthCheckResult::new("c", true, "ok"),
            HealthCheckResult::new("d", false, "down"),
        ];
        let report = HealthReport::from_results(results);
        assert_eq!(report.success_rate, 75.0);
        assert!(report.overall_passed);
        assert_eq!(report.passed_count(), 3);
        assert_eq!(report.total_count(), 4);
    }

    #[test]
    fn test_health_report_below_threshold() {
        let results = vec![
            HealthCheckResult::new("a", true, "ok"),
            HealthCheckResult::new("b", false, "down"),
            HealthCheckResult::new("c", false, "down"),
        ];
        let report = HealthReport::from_results(results);
        assert!(!report.overall_passed);
    }

    #[test]
    fn test_health_report_empty_suite_does_not_pass() {
        let report = HealthReport::from_results(Vec::new());
        assert_eq!(report.success_rate, 0.0);
        assert!(!report.overall_passed);
    }

    #[test]
    fn test_execution_result_succeeded() {
        let ok = ExecutionResult {
            exit_code: 0,
            ..Default::default()
        };
        assert!(ok.succeeded());

        let bad = ExecutionResult {
            exit_code: 2,
            ..Default::default()
        };
        assert!(!bad.succeeded());
    }
}

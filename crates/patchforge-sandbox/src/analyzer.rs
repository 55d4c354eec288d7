//! Result analysis: raw execution data into a final [`SandboxTest`].

use chrono::{DateTime, Utc};
use tracing::info;

use patchforge_core::{
    ExecutionResult, HealthReport, SandboxTest, StateDiff, SystemState, TestStatus,
};

/// Turns execution data into a scored, classified test record.
#[derive(Debug, Default)]
pub struct ResultAnalyzer;

/// Raw inputs to one analysis.
pub struct AnalysisInput {
    pub test_id: String,
    pub patch_id: String,
    pub asset_id: String,
    pub image: String,
    pub state_before: SystemState,
    pub execution: ExecutionResult,
    pub state_after: SystemState,
    pub state_diff: StateDiff,
    pub health: HealthReport,
    pub container_logs: String,
    pub started_at: DateTime<Utc>,
}

impl ResultAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyze a completed run.
    ///
    /// Status: `passed` iff the patch exited 0 and the health aggregate
    /// met its threshold; `failed` otherwise. Harness exceptions never
    /// reach this path; they produce an errored record via
    /// [`ResultAnalyzer::errored`].
    pub fn analyze(&self, input: AnalysisInput) -> SandboxTest {
        let patch_ok = input.execution.succeeded();
        let health_ok = input.health.overall_passed;

        let status = if patch_ok && health_ok {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };

        let confidence = confidence(&input.execution, &input.health, status);
        let issues = identify_issues(&input.execution, &input.health);
        let warnings = identify_warnings(&input.execution, &input.health);

        info!(
            "test {} analyzed: {:?} (confidence {:.0})",
            input.test_id, status, confidence
        );

        SandboxTest {
            test_id: input.test_id,
            patch_id: input.patch_id,
            asset_id: input.asset_id,
            image: input.image,
            state_before: input.state_before,
            execution: input.execution,
            state_after: input.state_after,
            state_diff: input.state_diff,
            health: input.health,
            container_logs: input.container_logs,
            status,
            confidence,
            issues,
            warnings,
            started_at: input.started_at,
            completed_at: Utc::now(),
        }
    }

    /// Record for a harness failure: status `errored`, a populated
    /// issues list, and whatever partial data exists.
    pub fn errored(
        &self,
        test_id: &str,
        patch_id: &str,
        asset_id: &str,
        image: &str,
        error: &str,
        started_at: DateTime<Utc>,
    ) -> SandboxTest {
        SandboxTest {
            test_id: test_id.to_string(),
            patch_id: patch_id.to_string(),
            asset_id: asset_id.to_string(),
            image: image.to_string(),
            state_before: SystemState::default(),
            execution: ExecutionResult {
                exit_code: -1,
                ..ExecutionResult::default()
            },
            state_after: SystemState::default(),
            state_diff: StateDiff::default(),
            health: HealthReport::default(),
            container_logs: String::new(),
            status: TestStatus::Errored,
            confidence: 0.0,
            issues: vec![format!("harness error: {error}")],
            warnings: Vec::new(),
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// Human-readable report for operators.
    pub fn render_report(&self, test: &SandboxTest) -> String {
        let mut lines = vec![
            "=".repeat(72),
            "SANDBOX TEST REPORT".to_string(),
            "=".repeat(72),
            format!("Test:       {}", test.test_id),
            format!("Patch:      {}", test.patch_id),
            format!("Asset:      {}", test.asset_id),
            format!("Image:      {}", test.image),
            format!("Status:     {:?}", test.status),
            format!("Confidence: {:.0}/100", test.confidence),
            String::new(),
            format!("Patch exit code: {}", test.execution.exit_code),
            format!(
                "Health checks:   {}/{} passed ({:.0}%)",
                test.health.passed_count(),
                test.health.total_count(),
                test.health.success_rate
            ),
        ];

        if !test.state_diff.updated_packages.is_empty() {
            lines.push(String::new());
            lines.push("Updated packages:".to_string());
            for change in &test.state_diff.updated_packages {
                lines.push(format!(
                    "  {}: {} -> {}",
                    change.package, change.before_version, change.after_version
                ));
            }
        }

        if !test.issues.is_empty() {
            lines.push(String::new());
            lines.push("Issues:".to_string());
            for issue in &test.issues {
                lines.push(format!("  - {issue}"));
            }
        }

        if !test.warnings.is_empty() {
            lines.push(String::new());
            lines.push("Warnings:".to_string());
            for warning in &test.warnings {
                lines.push(format!("  - {warning}"));
            }
        }

        lines.push("=".repeat(72));
        lines.join("\n")
    }
}

/// Confidence in [0, 100]: +50 for a pass, +20 for a zero exit, +10 for
/// empty stderr, up to +20 proportional to the health success rate.
fn confidence(execution: &ExecutionResult, health: &HealthReport, status: TestStatus) -> f64 {
    let mut score = 0.0;

    if status == TestStatus::Passed {
        score += 50.0;
    }
    if execution.exit_code == 0 {
        score += 20.0;
    }
    if execution.stderr.trim().is_empty() {
        score += 10.0;
    }
    score += health.success_rate / 100.0 * 20.0;

    score.min(100.0)
}

fn identify_issues(execution: &ExecutionResult, health: &HealthReport) -> Vec<String> {
    let mut issues = Vec::new();

    if !execution.succeeded() {
        issues.push(format!(
            "patch execution failed with exit code {}",
            execution.exit_code
        ));
    }

    for check in health.results.iter().filter(|r| !r.passed) {
        issues.push(format!("health check failed: {} - {}", check.name, check.message));
    }

    issues
}

fn identify_warnings(execution: &ExecutionResult, health: &HealthReport) -> Vec<String> {
    let mut warnings = Vec::new();

    if execution.succeeded() && !execution.stderr.trim().is_empty() {
        warnings.push("patch execution produced stderr output".to_string());
    }

    if (50.0..70.0).contains(&health.success_rate) {
        warnings.push(format!(
            "low health check success rate: {:.1}%",
            health.success_rate
        ));
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchforge_core::HealthCheckResult;

    fn health(passed: usize, failed: usize) -> HealthReport {
        let mut results = Vec::new();
        for i in 0..passed {
            results.push(HealthCheckResult::new(format!("ok-{i}"), true, "fine"));
        }
        for i in 0..failed {
            results.push(HealthCheckResult::new(format!("bad-{i}"), false, "down"));
        }
        HealthReport::from_results(results)
    }

    fn input(exit_code: i32, stderr: &str, health_report: HealthReport) -> AnalysisInput {
        AnalysisInput {
            test_id: "twin-test-1".to_string(),
            patch_id: "patch_0001".to_string(),
            asset_id: "web-01".to_string(),
            image: "ubuntu:22.04".to_string(),
            state_before: SystemState::default(),
            execution: ExecutionResult {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
                duration_ms: 1200,
            },
            state_after: SystemState::default(),
            state_diff: StateDiff::default(),
            health: health_report,
            container_logs: String::new(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_clean_pass_scores_100() {
        let test = ResultAnalyzer::new().analyze(input(0, "", health(4, 0)));
        assert_eq!(test.status, TestStatus::Passed);
        assert_eq!(test.confidence, 100.0);
        assert!(test.issues.is_empty());
        assert!(test.warnings.is_empty());
    }

    #[test]
    fn test_failed_exit_code_fails_test() {
        let test = ResultAnalyzer::new().analyze(input(1, "boom", health(4, 0)));
        assert_eq!(test.status, TestStatus::Failed);
        // exit!=0: no 50, no 20; stderr non-empty: no 10; health 20.
        assert_eq!(test.confidence, 20.0);
        assert!(test.issues.iter().any(|i| i.contains("exit code 1")));
    }

    #[test]
    fn test_health_below_threshold_fails_even_with_zero_exit() {
        let test = ResultAnalyzer::new().analyze(input(0, "", health(1, 1)));
        assert_eq!(test.status, TestStatus::Failed);
        // 0 + 20 + 10 + 10 (50% of 20)
        assert_eq!(test.confidence, 40.0);
        assert!(test.issues.iter().any(|i| i.contains("health check failed")));
        assert!(test
            .warnings
            .iter()
            .any(|w| w.contains("low health check success rate")));
    }

    #[test]
    fn test_stderr_on_success_is_a_warning() {
        let test = ResultAnalyzer::new().analyze(input(0, "deprecation notice", health(3, 0)));
        assert_eq!(test.status, TestStatus::Passed);
        assert_eq!(test.confidence, 90.0);
        assert!(test
            .warnings
            .iter()
            .any(|w| w.contains("stderr output")));
    }

    #[test]
    fn test_errored_record_has_issue_and_zero_confidence() {
        let test = ResultAnalyzer::new().errored(
            "twin-test-2",
            "patch_0002",
            "db-01",
            "rockylinux:9",
            "provisioning failed: image pull failed",
            Utc::now(),
        );
        assert_eq!(test.status, TestStatus::Errored);
        assert_eq!(test.confidence, 0.0);
        assert!(test.issues[0].contains("provisioning failed"));
    }

    #[test]
    fn test_render_report_includes_key_facts() {
        let analyzer = ResultAnalyzer::new();
        let test = analyzer.analyze(input(0, "", health(2, 0)));
        let report = analyzer.render_report(&test);
        assert!(report.contains("SANDBOX TEST REPORT"));
        assert!(report.contains("twin-test-1"));
        assert!(report.contains("Passed"));
    }
}

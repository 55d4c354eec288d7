//! Patch requests, generated artifacts, and static validation reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::asset::{OsFamily, PackageManager};
use super::{CoreError, Result};

/// Remediation strategy requested from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatchStrategy {
    #[default]
    PackageUpdate,
    ConfigChange,
    Workaround,
}

/// Lifecycle state of a patch artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    Generated,
    Validated,
    ValidationFailed,
    TestPending,
    TestPassed,
    TestFailed,
    Approved,
    Rejected,
}

impl PatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchStatus::Generated => "generated",
            PatchStatus::Validated => "validated",
            PatchStatus::ValidationFailed => "validation_failed",
            PatchStatus::TestPending => "test_pending",
            PatchStatus::TestPassed => "test_passed",
            PatchStatus::TestFailed => "test_failed",
            PatchStatus::Approved => "approved",
            PatchStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a single validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl IssueSeverity {
    /// Penalty subtracted from the safety score per issue of this severity.
    pub fn penalty(&self) -> f64 {
        match self {
            IssueSeverity::Critical => 0.5,
            IssueSeverity::High => 0.2,
            IssueSeverity::Medium => 0.1,
            IssueSeverity::Low => 0.05,
        }
    }
}

/// One issue found during static validation of a patch script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub description: String,
    pub line_number: Option<usize>,
}

impl ValidationIssue {
    pub fn new(severity: IssueSeverity, description: impl Into<String>) -> Self {
        Self {
            severity,
            description: description.into(),
            line_number: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line_number = Some(line);
        self
    }
}

/// Immutable report produced by the static patch validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub syntax_valid: bool,
    pub issues: Vec<ValidationIssue>,
    /// Text matched by forbidden-command patterns; any entry disqualifies.
    pub forbidden_commands: Vec<String>,
    /// Text matched by suspicious patterns; warnings only.
    pub suspicious_patterns: Vec<String>,
    /// Safety features the script lacks (shebang, error guard, ...).
    pub missing_safety_features: Vec<String>,
    /// Safety score in [0, 1]; 0.0 whenever a forbidden command matched.
    pub safety_score: f64,
    pub is_valid: bool,
}

impl ValidationReport {
    /// A report for a script that never reached the validator (e.g. the
    /// LLM call itself failed).
    pub fn not_validated(reason: &str) -> Self {
        Self {
            syntax_valid: false,
            issues: vec![ValidationIssue::new(IssueSeverity::Critical, reason)],
            forbidden_commands: Vec::new(),
            suspicious_patterns: Vec::new(),
            missing_safety_features: Vec::new(),
            safety_score: 0.0,
            is_valid: false,
        }
    }
}

/// Request to generate a patch for one finding on one target platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
    /// CVE id (or synthetic id) of the finding being remediated.
    pub finding_ref: String,
    pub os_family: OsFamily,
    pub os_version: String,
    pub package_manager: PackageManager,
    pub strategy: PatchStrategy,
}

/// A generated, validated, possibly sandbox-tested remediation script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchArtifact {
    pub patch_id: String,
    pub finding_ref: String,
    pub strategy: PatchStrategy,
    /// Executable shell script body.
    pub script: String,
    pub rollback_script: Option<String>,
    /// Identifier of the LLM model that produced the script.
    pub llm_model: String,
    /// Prompt sent to the model, kept for audit.
    pub llm_prompt: String,
    /// Raw model response before extraction.
    pub llm_response: String,
    /// Generation confidence in [0, 1].
    pub confidence: f64,
    pub validation: ValidationReport,
    pub status: PatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PatchArtifact {
    /// Move the artifact to a new status, enforcing the promotion guard:
    /// `test_passed` requires confidence >= 0.6, valid syntax, and zero
    /// forbidden-command matches.
    pub fn transition(&mut self, to: PatchStatus) -> Result<()> {
        if to == PatchStatus::TestPassed {
            if self.confidence < 0.6 {
                return Err(self.transition_err(to, "confidence below 0.6"));
            }
            if !self.validation.syntax_valid {
                return Err(self.transition_err(to, "syntax check failed"));
            }
            if !self.validation.forbidden_commands.is_empty() {
                return Err(self.transition_err(to, "forbidden commands present"));
            }
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn transition_err(&self, to: PatchStatus, reason: &str) -> CoreError {
        CoreError::InvalidStatusTransition {
            from: self.status.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        }
    }
}

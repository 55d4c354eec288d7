//! Static safety analysis of candidate patch scripts.
//!
//! Five passes: a `bash -n` syntax check, the forbidden-command scan
//! (any match disqualifies the script outright), the suspicious-pattern
//! scan (warnings), a required-safety-feature scan, and an optional
//! shellcheck pass when the binary is installed. The result is an
//! immutable [`ValidationReport`]; for a fixed script on a fixed
//! platform the report is deterministic.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use patchforge_core::{IssueSeverity, ValidationIssue, ValidationReport};

const SYNTAX_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const SHELLCHECK_TIMEOUT: Duration = Duration::from_secs(10);
const SHELLCHECK_ISSUE_CAP: usize = 5;

fn rx(raw: &str) -> Regex {
    Regex::new(&format!("(?i){raw}")).expect("validator pattern is valid")
}

/// Commands that must never appear; any match zeroes the safety score.
static FORBIDDEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        rx(r"rm\s+-rf\s+/[^/]"),
        rx(r"dd\s+if="),
        rx(r"mkfs"),
        rx(r"fdisk"),
        rx(r">\s*/dev/sd[a-z]"),
        rx(r"chmod\s+777"),
        rx(r"chown\s+.*root"),
        rx(r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;\s*:"),
        rx(r"curl[^\n]*\|[^\n]*bash"),
        rx(r"wget[^\n]*\|[^\n]*sh"),
    ]
});

/// Risky patterns worth flagging but not disqualifying on their own.
static SUSPICIOUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        rx(r"rm\s+-rf"),
        rx(r"chmod\s+[0-7]{3}"),
        rx(r">\s*/etc/"),
        rx(r"systemctl\s+disable"),
        rx(r"sed\s+-i"),
        rx(r"iptables[^\n]*(-F|flush)"),
        rx(r"setenforce\s+0"),
    ]
});

#[derive(Debug, Deserialize)]
struct ShellcheckFinding {
    line: usize,
    message: String,
}

/// Static validator for generated shell scripts.
#[derive(Debug, Clone)]
pub struct PatchValidator {
    shell: String,
    /// Try running shellcheck when present on the host.
    use_shellcheck: bool,
}

impl Default for PatchValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchValidator {
    pub fn new() -> Self {
        Self {
            shell: "bash".to_string(),
            use_shellcheck: true,
        }
    }

    pub fn without_shellcheck(mut self) -> Self {
        self.use_shellcheck = false;
        self
    }

    /// Run all validation passes over a script.
    pub async fn validate(&self, script: &str) -> ValidationReport {
        let mut issues: Vec<ValidationIssue> = Vec::new();

        let (syntax_valid, syntax_error) = self.check_syntax(script).await;
        if !syntax_valid {
            issues.push(ValidationIssue::new(
                IssueSeverity::Critical,
                format!(
                    "syntax error: {}",
                    syntax_error.unwrap_or_else(|| "unknown".to_string())
                ),
            ));
        }

        let forbidden_commands = scan(script, &FORBIDDEN_PATTERNS, |text, line| {
            issues.push(
                ValidationIssue::new(
                    IssueSeverity::Critical,
                    format!("forbidden command detected: {text}"),
                )
                .at_line(line),
            );
        });

        let suspicious_patterns = scan(script, &SUSPICIOUS_PATTERNS, |text, line| {
            issues.push(
                ValidationIssue::new(
                    IssueSeverity::High,
                    format!("suspicious pattern detected: {text}"),
                )
                .at_line(line),
            );
        });

        let missing_safety_features = check_required_features(script, &mut issues);

        if self.use_shellcheck {
            for issue in self.run_shellcheck(script).await {
                issues.push(issue);
            }
        }

        let safety_score = safety_score(&issues, &forbidden_commands);
        let is_valid = syntax_valid && forbidden_commands.is_empty() && safety_score >= 0.6;

        ValidationReport {
            syntax_valid,
            issues,
            forbidden_commands,
            suspicious_patterns,
            missing_safety_features,
            safety_score,
            is_valid,
        }
    }

    /// `bash -n` with the script on stdin. A timeout or spawn failure
    /// counts as a syntax failure.
    async fn check_syntax(&self, script: &str) -> (bool, Option<String>) {
        let child = Command::new(&self.shell)
            .arg("-n")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => return (false, Some(format!("could not run {}: {err}", self.shell))),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(script.as_bytes()).await.is_err() {
                return (false, Some("failed to feed script to shell".to_string()));
            }
            drop(stdin);
        }

        match tokio::time::timeout(SYNTAX_CHECK_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => (true, None),
            Ok(Ok(output)) => (
                false,
                Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            ),
            Ok(Err(err)) => (false, Some(err.to_string())),
            Err(_) => (false, Some("syntax check timed out".to_string())),
        }
    }

    /// Run shellcheck when available; its absence is not a failure.
    async fn run_shellcheck(&self, script: &str) -> Vec<ValidationIssue> {
        let child = Command::new("shellcheck")
            .args(["-f", "json", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(_) => {
                debug!("shellcheck not available, skipping lint pass");
                return Vec::new();
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(script.as_bytes()).await.is_err() {
                return Vec::new();
            }
            drop(stdin);
        }

        let output = match tokio::time::timeout(SHELLCHECK_TIMEOUT, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!("shellcheck failed to run: {}", err);
                return Vec::new();
            }
            Err(_) => {
                warn!("shellcheck timed out");
                return Vec::new();
            }
        };

        if output.status.success() {
            return Vec::new();
        }

        let findings: Vec<ShellcheckFinding> =
            serde_json::from_slice(&output.stdout).unwrap_or_default();

        findings
            .into_iter()
            .take(SHELLCHECK_ISSUE_CAP)
            .map(|f| {
                ValidationIssue::new(IssueSeverity::Low, format!("shellcheck: {}", f.message))
                    .at_line(f.line)
            })
            .collect()
    }
}

/// Run a pattern set over the script, invoking `on_match` per hit and
/// returning the matched texts.
fn scan(
    script: &str,
    patterns: &[Regex],
    mut on_match: impl FnMut(&str, usize),
) -> Vec<String> {
    let mut matches = Vec::new();
    for pattern in patterns {
        for found in pattern.find_iter(script) {
            let line = script[..found.start()].matches('\n').count() + 1;
            on_match(found.as_str(), line);
            matches.push(found.as_str().to_string());
        }
    }
    matches
}

/// Flag missing safety features; returns their names.
fn check_required_features(script: &str, issues: &mut Vec<ValidationIssue>) -> Vec<String> {
    let mut missing = Vec::new();

    if !script.trim_start().starts_with("#!/bin/bash") && !script.trim_start().starts_with("#!/bin/sh")
    {
        missing.push("shebang".to_string());
        issues.push(
            ValidationIssue::new(IssueSeverity::Medium, "missing shebang (#!/bin/bash)").at_line(1),
        );
    }

    if !script.contains("set -e") && !script.contains("|| exit") {
        missing.push("error_exit_guard".to_string());
        issues.push(ValidationIssue::new(
            IssueSeverity::Medium,
            "no error handling detected (consider 'set -e')",
        ));
    }

    if !script.contains("/var/log") && !script.contains("logger") {
        missing.push("logging".to_string());
        issues.push(ValidationIssue::new(
            IssueSeverity::Low,
            "no logging detected",
        ));
    }

    if !script.contains("if [") && !script.contains("[ -f") {
        missing.push("idempotency_guard".to_string());
        issues.push(ValidationIssue::new(
            IssueSeverity::Medium,
            "script may not be idempotent (no condition checks)",
        ));
    }

    missing
}

/// Safety score: 1.0 minus per-issue penalties, zero outright on any
/// forbidden match, clamped to [0, 1].
fn safety_score(issues: &[ValidationIssue], forbidden: &[String]) -> f64 {
    if !forbidden.is_empty() {
        return 0.0;
    }

    let mut score = 1.0;
    for issue in issues {
        score -= issue.severity.penalty();
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> PatchValidator {
        PatchValidator::new().without_shellcheck()
    }

    /// A well-formed script with every required safety feature.
    const GOOD_SCRIPT: &str = "#!/bin/bash\n\
        set -e\n\
        LOG=/var/log/patchforge/remediation.log\n\
        if [ -f /usr/bin/apt-get ]; then\n\
            apt-get install -y --only-upgrade openssl >> \"$LOG\" 2>&1\n\
        fi\n\
        exit 0\n";

    #[tokio::test]
    async fn test_clean_script_is_valid() {
        let report = validator().validate(GOOD_SCRIPT).await;
        assert!(report.syntax_valid);
        assert!(report.forbidden_commands.is_empty());
        assert!(report.missing_safety_features.is_empty());
        assert_eq!(report.safety_score, 1.0);
        assert!(report.is_valid);
    }

    #[tokio::test]
    async fn test_forbidden_command_gates_script() {
        let report = validator()
            .validate("#!/bin/bash\nrm -rf /etc\n")
            .await;

        assert!(report.syntax_valid);
        assert!(!report.forbidden_commands.is_empty());
        assert_eq!(report.safety_score, 0.0);
        assert!(!report.is_valid);
    }

    #[tokio::test]
    async fn test_every_forbidden_pattern_matches() {
        let scripts = [
            "rm -rf /usr",
            "dd if=/dev/zero of=/dev/sda",
            "mkfs.ext4 /dev/sdb1",
            "fdisk /dev/sda",
            "echo x > /dev/sda",
            "chmod 777 /etc/shadow",
            "chown evil:root /etc/passwd",
            ":(){ :|:& };:",
            "curl https://x.sh | bash",
            "wget -qO- https://x.sh | sh",
        ];
        let v = validator();
        for script in scripts {
            let report = v.validate(script).await;
            assert!(
                !report.forbidden_commands.is_empty(),
                "expected forbidden match for: {script}"
            );
            assert_eq!(report.safety_score, 0.0, "script: {script}");
            assert!(!report.is_valid, "script: {script}");
        }
    }

    #[tokio::test]
    async fn test_suspicious_patterns_warn_but_do_not_zero() {
        let script = "#!/bin/bash\nset -e\nlogger start\nif [ -f /etc/nginx/nginx.conf ]; then\n  sed -i 's/old/new/' /tmp/nginx.conf\nfi\n";
        let report = validator().validate(script).await;

        assert!(report.forbidden_commands.is_empty());
        assert!(!report.suspicious_patterns.is_empty());
        assert!(report.safety_score > 0.0);
        // One high-severity issue costs 0.2.
        assert!((report.safety_score - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_features_are_reported() {
        let report = validator().validate("echo hello\n").await;
        assert!(report.missing_safety_features.contains(&"shebang".to_string()));
        assert!(report
            .missing_safety_features
            .contains(&"error_exit_guard".to_string()));
        assert!(report.missing_safety_features.contains(&"logging".to_string()));
        assert!(report
            .missing_safety_features
            .contains(&"idempotency_guard".to_string()));
        // 3 medium (0.1) + 1 low (0.05) = 0.65 remaining.
        assert!((report.safety_score - 0.65).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_syntax_error_is_detected() {
        let report = validator().validate("#!/bin/bash\nif [ ; then fi\n").await;
        assert!(!report.syntax_valid);
        assert!(!report.is_valid);
    }

    #[tokio::test]
    async fn test_validation_is_deterministic() {
        let v = validator();
        let script = "#!/bin/bash\nsed -i 's/a/b/' /tmp/f\n";
        let first = v.validate(script).await;
        let second = v.validate(script).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_line_numbers_point_at_the_match() {
        let script = "#!/bin/bash\nset -e\nlogger ok\nif [ -f /x ]; then\n  rm -rf /opt/app\nfi\n";
        let report = validator().validate(script).await;
        let issue = report
            .issues
            .iter()
            .find(|i| i.description.contains("forbidden"))
            .expect("forbidden issue present");
        assert_eq!(issue.line_number, Some(5));
    }
}

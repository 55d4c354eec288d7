//! Auxiliary sandbox check suites.
//!
//! Beyond the role-tagged health checks, two extra suites can run after
//! a patch: smoke checks (is the box still basically usable) and
//! security checks (did the patch quietly weaken the system). Their
//! results feed the test record's warnings rather than gating the
//! pass/fail status.

use serde_json::json;
use tracing::info;

use patchforge_core::{HealthCheckResult, HealthReport};

use crate::runtime::ContainerRuntime;

/// Disk usage above this percentage fails the smoke check.
const DISK_USAGE_LIMIT: u32 = 90;

/// Basic usability checks after a patch.
pub async fn run_smoke_checks(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
) -> HealthReport {
    let mut results = Vec::new();

    // The package manager must still answer.
    let pm = runtime
        .exec(
            container_id,
            "apt-get --version 2>/dev/null || dnf --version 2>/dev/null || yum --version 2>/dev/null || zypper --version 2>/dev/null",
        )
        .await;
    results.push(match pm {
        Ok(output) => HealthCheckResult::new(
            "package_manager_responsive",
            output.success(),
            if output.success() {
                "package manager responds"
            } else {
                "package manager does not respond"
            },
        ),
        Err(err) => HealthCheckResult::new(
            "package_manager_responsive",
            false,
            format!("probe failed: {err}"),
        ),
    });

    // Root filesystem not filled up by the patch.
    let disk = runtime
        .exec(
            container_id,
            "df -P / | tail -n 1 | awk '{print $5}' | tr -d '%'",
        )
        .await;
    results.push(match disk {
        Ok(output) => match output.stdout.trim().parse::<u32>() {
            Ok(usage) => HealthCheckResult::new(
                "disk_space_available",
                usage < DISK_USAGE_LIMIT,
                format!("root filesystem at {usage}% usage"),
            )
            .with_details(json!({"usage_percent": usage})),
            Err(_) => HealthCheckResult::new(
                "disk_space_available",
                false,
                "could not read disk usage",
            ),
        },
        Err(err) => {
            HealthCheckResult::new("disk_space_available", false, format!("probe failed: {err}"))
        }
    });

    let report = HealthReport::from_results(results);
    info!(
        "smoke checks: {}/{} passed",
        report.passed_count(),
        report.total_count()
    );
    report
}

/// Security posture checks: a patch must not quietly widen access.
pub async fn run_security_checks(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
) -> HealthReport {
    let mut results = Vec::new();

    // No uid-0 accounts beyond root.
    let users = runtime
        .exec(
            container_id,
            "getent passwd | awk -F: '$3 == 0 {print $1}' | grep -v '^root$' || true",
        )
        .await;
    results.push(match users {
        Ok(output) => {
            let extras: Vec<&str> = output.stdout.lines().filter(|l| !l.is_empty()).collect();
            HealthCheckResult::new(
                "no_extra_root_accounts",
                extras.is_empty(),
                if extras.is_empty() {
                    "only root has uid 0".to_string()
                } else {
                    format!("unexpected uid-0 accounts: {}", extras.join(", "))
                },
            )
        }
        Err(err) => HealthCheckResult::new(
            "no_extra_root_accounts",
            false,
            format!("probe failed: {err}"),
        ),
    });

    // No world-writable files under the critical paths.
    let writable = runtime
        .exec(
            container_id,
            "find /etc /usr/bin /usr/sbin -type f -perm -002 2>/dev/null | head -n 5",
        )
        .await;
    results.push(match writable {
        Ok(output) => {
            let hits: Vec<&str> = output.stdout.lines().filter(|l| !l.is_empty()).collect();
            HealthCheckResult::new(
                "no_world_writable_files",
                hits.is_empty(),
                if hits.is_empty() {
                    "no world-writable files in critical paths".to_string()
                } else {
                    format!("world-writable files found: {}", hits.join(", "))
                },
            )
        }
        Err(err) => HealthCheckResult::new(
            "no_world_writable_files",
            false,
            format!("probe failed: {err}"),
        ),
    });

    // Root login over ssh stays disabled when sshd is installed.
    let ssh = runtime
        .exec(
            container_id,
            "if [ -f /etc/ssh/sshd_config ]; then grep -iq '^PermitRootLogin no' /etc/ssh/sshd_config && echo secure || echo insecure; else echo absent; fi",
        )
        .await;
    if let Ok(output) = ssh {
        let verdict = output.stdout.trim().to_string();
        if verdict != "absent" {
            results.push(HealthCheckResult::new(
                "ssh_root_login_disabled",
                verdict == "secure",
                format!("sshd root login is {verdict}"),
            ));
        }
    }

    let report = HealthReport::from_results(results);
    info!(
        "security checks: {}/{} passed",
        report.passed_count(),
        report.total_count()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExecOutput, MockRuntime};

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_smoke_checks_pass_on_healthy_box() {
        let runtime = MockRuntime::new()
            .with_response("--version", ok("apt 2.4.9"))
            .with_response("df -P /", ok("42\n"));
        let report = run_smoke_checks(&runtime, "c1").await;
        assert!(report.overall_passed);
        assert_eq!(report.total_count(), 2);
    }

    #[tokio::test]
    async fn test_smoke_checks_flag_full_disk() {
        let runtime = MockRuntime::new()
            .with_response("--version", ok("apt 2.4.9"))
            .with_response("df -P /", ok("97\n"));
        let report = run_smoke_checks(&runtime, "c1").await;
        let disk = report
            .results
            .iter()
            .find(|r| r.name == "disk_space_available")
            .unwrap();
        assert!(!disk.passed);
        assert!(disk.message.contains("97%"));
    }

    #[tokio::test]
    async fn test_security_checks_flag_extra_root_account() {
        let runtime = MockRuntime::new().with_response("getent passwd", ok("backdoor\n"));
        let report = run_security_checks(&runtime, "c1").await;
        let users = report
            .results
            .iter()
            .find(|r| r.name == "no_extra_root_accounts")
            .unwrap();
        assert!(!users.passed);
        assert!(users.message.contains("backdoor"));
    }

    #[tokio::test]
    async fn test_security_checks_flag_world_writable_files() {
        let runtime = MockRuntime::new()
            .with_response("find /etc", ok("/etc/shadow\n"));
        let report = run_security_checks(&runtime, "c1").await;
        let writable = report
            .results
            .iter()
            .find(|r| r.name == "no_world_writable_files")
            .unwrap();
        assert!(!writable.passed);
    }

    #[tokio::test]
    async fn test_ssh_check_skipped_when_sshd_absent() {
        let runtime = MockRuntime::new().with_response("sshd_config", ok("absent\n"));
        let report = run_security_checks(&runtime, "c1").await;
        assert!(report
            .results
            .iter()
            .all(|r| r.name != "ssh_root_login_disabled"));
    }

    #[tokio::test]
    async fn test_clean_container_passes_security_suite() {
        let runtime = MockRuntime::new().with_response("sshd_config", ok("secure\n"));
        let report = run_security_checks(&runtime, "c1").await;
        assert!(report.overall_passed);
    }
}

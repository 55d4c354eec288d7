//! Post-patch health checks.
//!
//! A role-tagged suite runs after the patch: baseline checks always
//! (init process alive, cron or an equivalent scheduler up), plus
//! web-server checks (HTTP port listening, endpoint responding) or
//! database checks (DB process alive, DB port listening) depending on
//! the asset role. The aggregate passes at a 70% success rate.

use serde_json::json;
use tracing::info;

use patchforge_core::{AssetRole, HealthCheckResult, HealthReport};

use crate::runtime::ContainerRuntime;

/// Check that PID 1 is alive (systemd or any init).
pub async fn check_init_running(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
) -> HealthCheckResult {
    match runtime.exec(container_id, "test -d /proc/1").await {
        Ok(output) if output.success() => {
            HealthCheckResult::new("init_running", true, "init process is alive")
        }
        Ok(_) => HealthCheckResult::new("init_running", false, "no init process found"),
        Err(err) => HealthCheckResult::new("init_running", false, format!("probe failed: {err}")),
    }
}

/// Check that a named service is active (systemd first, sysv fallback).
pub async fn check_service_running(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    service: &str,
) -> HealthCheckResult {
    let command = format!(
        "systemctl is-active {service} 2>/dev/null || service {service} status 2>/dev/null"
    );
    let name = format!("service_{service}_running");

    match runtime.exec(container_id, &command).await {
        Ok(output) => {
            let running = output.success();
            HealthCheckResult::new(
                name,
                running,
                format!(
                    "service {service} is {}",
                    if running { "running" } else { "not running" }
                ),
            )
            .with_details(json!({"service": service, "output": output.stdout.trim()}))
        }
        Err(err) => HealthCheckResult::new(name, false, format!("probe failed: {err}")),
    }
}

/// Check that a process with the given name is running.
pub async fn check_process_running(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    process: &str,
) -> HealthCheckResult {
    let name = format!("process_{process}_running");
    match runtime
        .exec(container_id, &format!("pgrep -x {process}"))
        .await
    {
        Ok(output) => {
            let running = output.success();
            HealthCheckResult::new(
                name,
                running,
                format!(
                    "process {process} is {}",
                    if running { "running" } else { "not running" }
                ),
            )
        }
        Err(err) => HealthCheckResult::new(name, false, format!("probe failed: {err}")),
    }
}

/// Check that a TCP port is listening.
pub async fn check_port_listening(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    port: u16,
) -> HealthCheckResult {
    let command = format!("ss -tuln 2>/dev/null | grep -q ':{port} ' || netstat -tuln 2>/dev/null | grep -q ':{port} '");
    let name = format!("port_{port}_listening");

    match runtime.exec(container_id, &command).await {
        Ok(output) => {
            let listening = output.success();
            HealthCheckResult::new(
                name,
                listening,
                format!(
                    "port {port} is {}",
                    if listening { "listening" } else { "not listening" }
                ),
            )
            .with_details(json!({"port": port}))
        }
        Err(err) => HealthCheckResult::new(name, false, format!("probe failed: {err}")),
    }
}

/// Check that an HTTP endpoint answers with a 2xx.
pub async fn check_http_endpoint(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    url: &str,
) -> HealthCheckResult {
    let command = format!("curl -f -s -o /dev/null -w '%{{http_code}}' {url}");
    let name = "http_endpoint_responding".to_string();

    match runtime.exec(container_id, &command).await {
        Ok(output) => {
            let code = output.stdout.trim().to_string();
            let healthy = output.success() && code.starts_with('2');
            HealthCheckResult::new(name, healthy, format!("HTTP {url} returned {code}"))
                .with_details(json!({"url": url, "http_code": code}))
        }
        Err(err) => HealthCheckResult::new(name, false, format!("probe failed: {err}")),
    }
}

/// Run the health-check suite for an asset role.
pub async fn run_health_checks(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    role: AssetRole,
) -> HealthReport {
    let mut results = Vec::new();

    // Baseline: init and a scheduler, regardless of role.
    results.push(check_init_running(runtime, container_id).await);
    results.push(check_service_running(runtime, container_id, "cron").await);

    match role {
        AssetRole::WebServer => {
            results.push(check_port_listening(runtime, container_id, 80).await);
            results.push(check_http_endpoint(runtime, container_id, "http://localhost/").await);
        }
        AssetRole::Database => {
            results.push(
                check_process_running(runtime, container_id, "postgres").await,
            );
            results.push(check_port_listening(runtime, container_id, 5432).await);
        }
        AssetRole::Generic => {}
    }

    let report = HealthReport::from_results(results);
    info!(
        "health checks: {}/{} passed ({:.0}%)",
        report.passed_count(),
        report.total_count(),
        report.success_rate
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

    fn fail() -> ExecOutput {
        ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_generic_role_runs_baseline_only() {
        let runtime = MockRuntime::new();
        let report = run_health_checks(&runtime, "c1", AssetRole::Generic).await;
        assert_eq!(report.total_count(), 2);
    }

    #[tokio::test]
    async fn test_web_server_role_adds_http_checks() {
        let runtime = MockRuntime::new()
            .with_response("curl", ok("200"));
        let report = run_health_checks(&runtime, "c1", AssetRole::WebServer).await;
        assert_eq!(report.total_count(), 4);
        assert!(report
            .results
            .iter()
            .any(|r| r.name == "port_80_listening"));
        assert!(report
            .results
            .iter()
            .any(|r| r.name == "http_endpoint_responding" && r.passed));
    }

    #[tokio::test]
    async fn test_database_role_adds_db_checks() {
        let runtime = MockRuntime::new();
        let report = run_health_checks(&runtime, "c1", AssetRole::Database).await;
        assert!(report
            .results
            .iter()
            .any(|r| r.name == "process_postgres_running"));
        assert!(report
            .results
            .iter()
            .any(|r| r.name == "port_5432_listening"));
    }

    #[tokio::test]
    async fn test_all_passing_suite_passes_overall() {
        // Mock default answers exit 0 for everything.
        let runtime = MockRuntime::new();
        let report = run_health_checks(&runtime, "c1", AssetRole::Generic).await;
        assert!(report.overall_passed);
        assert_eq!(report.success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_failing_checks_drop_below_threshold() {
        let runtime = MockRuntime::new()
            .with_response("systemctl is-active cron", fail())
            .with_response("test -d /proc/1", fail());
        let report = run_health_checks(&runtime, "c1", AssetRole::Generic).await;
        assert!(!report.overall_passed);
        assert_eq!(report.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_http_check_requires_2xx() {
        let runtime = MockRuntime::new().with_response("curl", ok("503"));
        let check = check_http_endpoint(&runtime, "c1", "http://localhost/").await;
        assert!(!check.passed);
        assert!(check.message.contains("503"));
    }
}

//! Patch execution inside a provisioned sandbox.
//!
//! The script body is copied to a fixed path, made executable, and run
//! through the shell with output captured demuxed. A hard 10-minute
//! deadline bounds the run; crossing the 8-minute soft budget is logged.
//! Optional probes rerun the patch for idempotency and verify rollback
//! restores the target package version.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use patchforge_core::{ExecutionResult, StateDiff, SystemState};
use patchforge_resilience::with_timeout;

use crate::error::{Result, SandboxError};
use crate::runtime::ContainerRuntime;
use crate::state::{capture_state, diff_states};

const PATCH_PATH: &str = "/tmp/patch_script.sh";
const ROLLBACK_PATH: &str = "/tmp/rollback_script.sh";
const SCRIPT_MODE: u32 = 0o755;

/// Hard wall-clock limit on one script run.
pub const EXEC_HARD_TIMEOUT: Duration = Duration::from_secs(600);
/// Soft budget; exceeding it is logged but not fatal.
pub const EXEC_SOFT_TIMEOUT: Duration = Duration::from_secs(480);

/// Outcome of the idempotency probe.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyOutcome {
    pub second_run: ExecutionResult,
    pub is_idempotent: bool,
    /// Whether the second run still changed state (logged, not fatal).
    pub changed_state: bool,
}

/// Outcome of the rollback probe.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackOutcome {
    pub rollback_run: ExecutionResult,
    /// Target package version equality against the pre-patch state.
    pub state_restored: bool,
}

/// Executes scripts inside one sandbox container.
pub struct PatchExecutor {
    runtime: Arc<dyn ContainerRuntime>,
}

impl PatchExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Copy a script into the container and run it under the deadline.
    pub async fn run_script(
        &self,
        container_id: &str,
        script: &str,
        path: &str,
    ) -> Result<ExecutionResult> {
        self.runtime
            .copy_content(container_id, path, script, SCRIPT_MODE)
            .await?;

        let exec = with_timeout(
            EXEC_HARD_TIMEOUT,
            self.runtime.exec(container_id, &format!("bash {path}")),
        )
        .await
        .map_err(|_| SandboxError::Timeout {
            stage: "patch execution".to_string(),
            seconds: EXEC_HARD_TIMEOUT.as_secs(),
        })??;

        let result = ExecutionResult {
            exit_code: exec.exit_code,
            stdout: exec.stdout,
            stderr: exec.stderr,
            duration_ms: exec.duration_ms,
        };

        if Duration::from_millis(result.duration_ms) > EXEC_SOFT_TIMEOUT {
            warn!(
                "script ran {}s, past the {}s soft budget",
                result.duration_ms / 1000,
                EXEC_SOFT_TIMEOUT.as_secs()
            );
        }

        Ok(result)
    }

    /// Run the patch script at its fixed path.
    pub async fn execute_patch(
        &self,
        container_id: &str,
        patch_script: &str,
    ) -> Result<ExecutionResult> {
        info!("executing patch in {}", container_id);
        self.run_script(container_id, patch_script, PATCH_PATH).await
    }

    /// Rerun the patch; a second run must exit 0 and ideally change
    /// nothing.
    pub async fn probe_idempotency(
        &self,
        container_id: &str,
        patch_script: &str,
    ) -> Result<IdempotencyOutcome> {
        info!("running idempotency probe in {}", container_id);

        let before = capture_state(self.runtime.as_ref(), container_id).await;
        let second_run = self.run_script(container_id, patch_script, PATCH_PATH).await?;
        let after = capture_state(self.runtime.as_ref(), container_id).await;

        let diff = diff_states(&before, &after);
        let changed_state = diff.has_changes;
        if changed_state {
            warn!("patch changed state on its second run");
        }

        Ok(IdempotencyOutcome {
            is_idempotent: second_run.succeeded(),
            second_run,
            changed_state,
        })
    }

    /// Run the rollback script and verify the target package is back at
    /// its pre-patch version.
    pub async fn probe_rollback(
        &self,
        container_id: &str,
        rollback_script: &str,
        pre_patch_state: &SystemState,
        target_package: Option<&str>,
    ) -> Result<RollbackOutcome> {
        info!("running rollback probe in {}", container_id);

        let rollback_run = self
            .run_script(container_id, rollback_script, ROLLBACK_PATH)
            .await?;

        if !rollback_run.succeeded() {
            return Ok(RollbackOutcome {
                rollback_run,
                state_restored: false,
            });
        }

        let state_restored = match target_package {
            Some(package) => {
                let current = capture_state(self.runtime.as_ref(), container_id).await;
                let before = pre_patch_state.packages.get(package);
                let now = current.packages.get(package);
                if before != now {
                    warn!(
                        "rollback did not restore {}: {:?} != {:?}",
                        package, before, now
                    );
                }
                before == now
            }
            // Without a target package the exit code is all we can judge.
            None => true,
        };

        Ok(RollbackOutcome {
            rollback_run,
            state_restored,
        })
    }

    /// Compute the before/after diff for a full patch run.
    pub fn diff(&self, before: &SystemState, after: &SystemState) -> StateDiff {
        diff_states(before, after)
    }
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
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_execute_patch_copies_then_runs() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = PatchExecutor::new(runtime.clone());

        let result = executor
            .execute_patch("c1", "#!/bin/bash\necho done")
            .await
            .unwrap();

        assert!(result.succeeded());
        let calls = runtime.calls();
        assert!(calls.iter().any(|c| c == "copy:c1:/tmp/patch_script.sh"));
        assert!(calls
            .iter()
            .any(|c| c.contains("bash /tmp/patch_script.sh")));
    }

    #[tokio::test]
    async fn test_failing_patch_reports_exit_code() {
        let runtime = Arc::new(MockRuntime::new().with_response(
            "bash /tmp/patch_script.sh",
            ExecOutput {
                exit_code: 2,
                stdout: String::new(),
                stderr: "package not found".to_string(),
                duration_ms: 5,
            },
        ));
        let executor = PatchExecutor::new(runtime);

        let result = executor.execute_patch("c1", "#!/bin/bash\nexit 2").await.unwrap();
        assert_eq!(result.exit_code, 2);
        assert!(result.stderr.contains("package not found"));
    }

    #[tokio::test]
    async fn test_idempotency_probe_passes_on_clean_second_run() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = PatchExecutor::new(runtime);

        let outcome = executor
            .probe_idempotency("c1", "#!/bin/bash\necho noop")
            .await
            .unwrap();

        assert!(outcome.is_idempotent);
        assert!(!outcome.changed_state);
    }

    #[tokio::test]
    async fn test_idempotency_probe_fails_on_nonzero_second_run() {
        let runtime = Arc::new(MockRuntime::new().with_response(
            "bash /tmp/patch_script.sh",
            ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "already applied".to_string(),
                duration_ms: 5,
            },
        ));
        let executor = PatchExecutor::new(runtime);

        let outcome = executor
            .probe_idempotency("c1", "#!/bin/bash\nexit 1")
            .await
            .unwrap();
        assert!(!outcome.is_idempotent);
    }

    #[tokio::test]
    async fn test_rollback_probe_verifies_package_version() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_response("command -v apt-get", ok("yes"))
                .with_response("dpkg-query", ok("openssl=1.1.1\n")),
        );
        let executor = PatchExecutor::new(runtime);

        let mut pre_patch = SystemState::default();
        pre_patch
            .packages
            .insert("openssl".to_string(), "1.1.1".to_string());

        let outcome = executor
            .probe_rollback("c1", "#!/bin/bash\necho rollback", &pre_patch, Some("openssl"))
            .await
            .unwrap();

        assert!(outcome.rollback_run.succeeded());
        assert!(outcome.state_restored);
    }

    #[tokio::test]
    async fn test_rollback_probe_detects_version_mismatch() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_response("command -v apt-get", ok("yes"))
                .with_response("dpkg-query", ok("openssl=1.1.1w\n")),
        );
        let executor = PatchExecutor::new(runtime);

        let mut pre_patch = SystemState::default();
        pre_patch
            .packages
            .insert("openssl".to_string(), "1.1.1".to_string());

        let outcome = executor
            .probe_rollback("c1", "#!/bin/bash\necho rollback", &pre_patch, Some("openssl"))
            .await
            .unwrap();
        assert!(!outcome.state_restored);
    }
}

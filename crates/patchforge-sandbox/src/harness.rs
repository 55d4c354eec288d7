//! The sandbox harness: full test lifecycle with guaranteed teardown.
//!
//! Lifecycle: provision -> capture state -> run patch -> recapture and
//! diff -> health checks -> analyze -> cleanup. The container is tied to
//! a scoped guard: the normal path tears it down explicitly, and the
//! guard's `Drop` schedules teardown when the test future panics, is
//! cancelled, or blows its wall-clock budget. A harness failure always
//! yields a persisted `SandboxTest` with status `errored`.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use patchforge_core::{
    AssetDescriptor, FindingStore, PatchArtifact, PatchStatus, SandboxTest, Settings, TestStatus,
};
use patchforge_resilience::with_timeout;

use crate::analyzer::{AnalysisInput, ResultAnalyzer};
use crate::error::{Result, SandboxError};
use crate::executor::PatchExecutor;
use crate::health::run_health_checks;
use crate::image::image_for;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::state::capture_state;

/// Harness tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub cpu_limit: f64,
    pub memory_mb: u64,
    pub provision_timeout: Duration,
    /// Wall-clock budget for the whole test.
    pub total_budget: Duration,
    pub run_idempotency_probe: bool,
    pub run_rollback_probe: bool,
    /// Run the post-patch security suite; failures become warnings.
    pub run_security_checks: bool,
    pub log_tail: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            cpu_limit: 2.0,
            memory_mb: 4096,
            provision_timeout: Duration::from_secs(60),
            total_budget: Duration::from_secs(1800),
            run_idempotency_probe: false,
            run_rollback_probe: false,
            run_security_checks: false,
            log_tail: 100,
        }
    }
}

impl HarnessConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cpu_limit: settings.sandbox_cpu_limit,
            memory_mb: settings.sandbox_mem_limit_mb,
            ..Self::default()
        }
    }
}

/// Scoped ownership of one sandbox container.
///
/// The normal path calls [`CleanupGuard::cleanup`], which awaits the
/// teardown. If the guard is instead dropped (panic, cancellation,
/// budget timeout), `Drop` spawns the teardown onto the runtime so the
/// container still goes away.
struct CleanupGuard {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: Option<String>,
}

impl CleanupGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, container_id: String) -> Self {
        Self {
            runtime,
            container_id: Some(container_id),
        }
    }

    async fn cleanup(mut self) {
        if let Some(id) = self.container_id.take() {
            let _ = self.runtime.stop(&id).await;
            if let Err(err) = self.runtime.remove(&id).await {
                warn!("failed to remove sandbox container {}: {}", id, err);
            }
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(id) = self.container_id.take() {
            let runtime = Arc::clone(&self.runtime);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    debug!("scheduling teardown of abandoned sandbox {}", id);
                    handle.spawn(async move {
                        let _ = runtime.stop(&id).await;
                        let _ = runtime.remove(&id).await;
                    });
                }
                Err(_) => warn!("no runtime available to tear down sandbox {}", id),
            }
        }
    }
}

/// Provisions sandboxes and rehearses patches inside them.
pub struct SandboxHarness {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn FindingStore>,
    analyzer: ResultAnalyzer,
    config: HarnessConfig,
}

impl SandboxHarness {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn FindingStore>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            analyzer: ResultAnalyzer::new(),
            config,
        }
    }

    /// Rehearse a patch against a sandbox mirroring the asset.
    ///
    /// Never fails outward: every outcome, including harness errors and
    /// a blown budget, is returned and persisted as a `SandboxTest`.
    pub async fn test_patch(
        &self,
        patch: &PatchArtifact,
        asset: &AssetDescriptor,
    ) -> SandboxTest {
        let test_id = new_test_id(asset, patch);
        let image = image_for(asset.os_family, &asset.os_version);
        let started_at = Utc::now();

        info!(
            "starting sandbox test {} for patch {} on {}",
            test_id, patch.patch_id, image
        );

        let _ = self.mark_patch(&patch.patch_id, PatchStatus::TestPending).await;

        let outcome = with_timeout(
            self.config.total_budget,
            self.run_stages(&test_id, patch, asset, &image),
        )
        .await;

        let test = match outcome {
            Ok(Ok(test)) => test,
            Ok(Err(err)) => {
                warn!("sandbox test {} errored: {}", test_id, err);
                self.analyzer.errored(
                    &test_id,
                    &patch.patch_id,
                    &asset.asset_id,
                    &image,
                    &err.to_string(),
                    started_at,
                )
            }
            Err(_) => {
                warn!(
                    "sandbox test {} exceeded its {}s budget",
                    test_id,
                    self.config.total_budget.as_secs()
                );
                self.analyzer.errored(
                    &test_id,
                    &patch.patch_id,
                    &asset.asset_id,
                    &image,
                    &format!(
                        "test exceeded the {}s wall-clock budget",
                        self.config.total_budget.as_secs()
                    ),
                    started_at,
                )
            }
        };

        let next_status = match test.status {
            TestStatus::Passed => Some(PatchStatus::TestPassed),
            TestStatus::Failed | TestStatus::Errored => Some(PatchStatus::TestFailed),
            TestStatus::Skipped => None,
        };
        if let Some(status) = next_status {
            let _ = self.mark_patch(&patch.patch_id, status).await;
        }

        if let Err(err) = self.store.save_sandbox_test(test.clone()).await {
            warn!("failed to persist sandbox test {}: {}", test.test_id, err);
        }

        test
    }

    async fn run_stages(
        &self,
        test_id: &str,
        patch: &PatchArtifact,
        asset: &AssetDescriptor,
        image: &str,
    ) -> Result<SandboxTest> {
        let started_at = Utc::now();

        // provisioning
        let mut spec = ContainerSpec::new(image, test_id)
            .with_limits(self.config.cpu_limit, self.config.memory_mb)
            .with_label("created-at", &started_at.to_rfc3339())
            .with_env("PATCHFORGE_TEST_MODE", "true");
        if asset.role == patchforge_core::AssetRole::WebServer {
            // The web health suite probes HTTP endpoints.
            spec = spec.with_network();
        }

        let container_id = with_timeout(self.config.provision_timeout, self.runtime.start(&spec))
            .await
            .map_err(|_| SandboxError::Timeout {
                stage: "provisioning".to_string(),
                seconds: self.config.provision_timeout.as_secs(),
            })?
            .map_err(SandboxError::into_provision)?;

        // The container now exists; from here every exit path must
        // destroy it.
        let guard = CleanupGuard::new(Arc::clone(&self.runtime), container_id.clone());

        let result = self
            .run_provisioned(test_id, patch, asset, image, &container_id, started_at)
            .await;

        guard.cleanup().await;
        result
    }

    async fn run_provisioned(
        &self,
        test_id: &str,
        patch: &PatchArtifact,
        asset: &AssetDescriptor,
        image: &str,
        container_id: &str,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<SandboxTest> {
        let ready = self
            .runtime
            .exec(container_id, "echo ready")
            .await
            .map_err(SandboxError::into_provision)?;
        if !ready.success() {
            return Err(SandboxError::Provision(
                "container did not become ready".to_string(),
            ));
        }

        let executor = PatchExecutor::new(Arc::clone(&self.runtime));

        // state_captured
        let state_before = capture_state(self.runtime.as_ref(), container_id).await;

        // patch_running
        let execution = executor.execute_patch(container_id, &patch.script).await?;

        // state_recaptured
        let state_after = capture_state(self.runtime.as_ref(), container_id).await;
        let state_diff = executor.diff(&state_before, &state_after);

        // health_checks
        let health = run_health_checks(self.runtime.as_ref(), container_id, asset.role).await;

        let container_logs = self
            .runtime
            .logs(container_id, self.config.log_tail)
            .await
            .unwrap_or_default();

        // analyzed
        let mut test = self.analyzer.analyze(AnalysisInput {
            test_id: test_id.to_string(),
            patch_id: patch.patch_id.clone(),
            asset_id: asset.asset_id.clone(),
            image: image.to_string(),
            state_before: state_before.clone(),
            execution,
            state_after,
            state_diff,
            health,
            container_logs,
            started_at,
        });

        if test.execution.succeeded() {
            self.run_probes(&mut test, patch, container_id, &state_before, &executor)
                .await;
        }

        if self.config.run_security_checks {
            let security = crate::suite::run_security_checks(self.runtime.as_ref(), container_id)
                .await;
            for check in security.results.iter().filter(|r| !r.passed) {
                test.warnings
                    .push(format!("security check failed: {} - {}", check.name, check.message));
            }
        }

        Ok(test)
    }

    /// Optional idempotency and rollback probes; outcomes land in the
    /// test's issues and warnings.
    async fn run_probes(
        &self,
        test: &mut SandboxTest,
        patch: &PatchArtifact,
        container_id: &str,
        state_before: &patchforge_core::SystemState,
        executor: &PatchExecutor,
    ) {
        if self.config.run_idempotency_probe {
            match executor.probe_idempotency(container_id, &patch.script).await {
                Ok(outcome) => {
                    if !outcome.is_idempotent {
                        test.issues.push(format!(
                            "patch is not idempotent: second run exited {}",
                            outcome.second_run.exit_code
                        ));
                        test.status = TestStatus::Failed;
                    } else if outcome.changed_state {
                        test.warnings
                            .push("patch changed state on its second run".to_string());
                    }
                }
                Err(err) => {
                    test.warnings
                        .push(format!("idempotency probe did not complete: {err}"));
                }
            }
        }

        if self.config.run_rollback_probe {
            let Some(rollback) = patch.rollback_script.as_deref() else {
                test.warnings
                    .push("rollback probe skipped: patch has no rollback script".to_string());
                return;
            };

            let target = test
                .state_diff
                .updated_packages
                .first()
                .map(|change| change.package.clone());

            match executor
                .probe_rollback(container_id, rollback, state_before, target.as_deref())
                .await
            {
                Ok(outcome) if outcome.state_restored => {
                    debug!("rollback probe restored pre-patch state");
                }
                Ok(outcome) => {
                    test.issues.push(format!(
                        "rollback did not restore pre-patch state (exit {})",
                        outcome.rollback_run.exit_code
                    ));
                }
                Err(err) => {
                    test.warnings
                        .push(format!("rollback probe did not complete: {err}"));
                }
            }
        }
    }

    /// Best-effort patch status update; the patch may live outside this
    /// store in some deployments.
    async fn mark_patch(&self, patch_id: &str, status: PatchStatus) -> bool {
        match self.store.update_patch_status(patch_id, status).await {
            Ok(()) => true,
            Err(err) => {
                debug!("could not move patch {} to {}: {}", patch_id, status, err);
                false
            }
        }
    }
}

fn new_test_id(asset: &AssetDescriptor, patch: &PatchArtifact) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("twin-{}-{}-{}", asset.asset_id, patch.patch_id, &hex[..8])
}

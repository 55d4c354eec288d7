//! Lifecycle guarantees of the sandbox harness: a test record on every
//! outcome, and no managed containers left behind on any exit path.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use patchforge_core::{
    AssetDescriptor, AssetRole, FindingStore, MemoryStore, OsFamily, PatchArtifact, PatchStatus,
    PatchStrategy, TestStatus, ValidationReport,
};
use patchforge_sandbox::{
    ContainerRuntime, ExecOutput, HarnessConfig, MockRuntime, SandboxHarness,
};

fn patch() -> PatchArtifact {
    PatchArtifact {
        patch_id: "patch_e2e01".to_string(),
        finding_ref: "CVE-2024-0001".to_string(),
        strategy: PatchStrategy::PackageUpdate,
        script: "#!/bin/bash\nset -e\napt-get install -y --only-upgrade openssl\n".to_string(),
        rollback_script: Some("#!/bin/bash\necho rollback\n".to_string()),
        llm_model: "test-model".to_string(),
        llm_prompt: String::new(),
        llm_response: String::new(),
        confidence: 0.85,
        validation: ValidationReport {
            syntax_valid: true,
            issues: Vec::new(),
            forbidden_commands: Vec::new(),
            suspicious_patterns: Vec::new(),
            missing_safety_features: Vec::new(),
            safety_score: 1.0,
            is_valid: true,
        },
        status: PatchStatus::Validated,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn web_asset() -> AssetDescriptor {
    AssetDescriptor::new("web-01", OsFamily::Ubuntu, "22.04").with_role(AssetRole::WebServer)
}

#[tokio::test]
async fn passing_test_is_persisted_with_full_record() {
    let runtime = Arc::new(
        MockRuntime::new()
            .with_response("command -v apt-get", ok("yes"))
            .with_response("dpkg-query", ok("openssl=1.1.1\n"))
            .with_response("curl", ok("200")),
    );
    let store = MemoryStore::shared();
    let harness = SandboxHarness::new(runtime.clone(), store.clone(), HarnessConfig::default());

    let test = harness.test_patch(&patch(), &web_asset()).await;

    assert_eq!(test.status, TestStatus::Passed);
    assert_eq!(test.image, "ubuntu:22.04");
    assert!(test.confidence >= 70.0);
    assert!(test.health.overall_passed);
    assert!(test.health.total_count() >= 4, "web role adds http checks");
    assert!(!test.container_logs.is_empty());
    assert!(test.state_before.packages.contains_key("openssl"));

    let persisted = store.sandbox_tests().await;
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].test_id, test.test_id);

    assert!(runtime.list_managed().await.unwrap().is_empty());
}

#[tokio::test]
async fn every_failure_path_still_removes_the_container() {
    // Provisioning failure.
    let runtime = Arc::new(MockRuntime::failing_start());
    let harness = SandboxHarness::new(
        runtime.clone(),
        MemoryStore::shared(),
        HarnessConfig::default(),
    );
    let test = harness.test_patch(&patch(), &web_asset()).await;
    assert_eq!(test.status, TestStatus::Errored);
    assert!(runtime.list_managed().await.unwrap().is_empty());

    // Runtime failure mid-execution.
    let runtime = Arc::new(MockRuntime::new().with_exec_failure("bash /tmp/patch_script.sh"));
    let harness = SandboxHarness::new(
        runtime.clone(),
        MemoryStore::shared(),
        HarnessConfig::default(),
    );
    let test = harness.test_patch(&patch(), &web_asset()).await;
    assert_eq!(test.status, TestStatus::Errored);
    assert!(runtime.list_managed().await.unwrap().is_empty());

    // Patch script failure (a real test outcome, not an error).
    let runtime = Arc::new(MockRuntime::new().with_response(
        "bash /tmp/patch_script.sh",
        ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "unable to locate package".to_string(),
            duration_ms: 10,
        },
    ));
    let store = MemoryStore::shared();
    let harness = SandboxHarness::new(runtime.clone(), store.clone(), HarnessConfig::default());
    let test = harness.test_patch(&patch(), &web_asset()).await;
    assert_eq!(test.status, TestStatus::Failed);
    assert!(runtime.list_managed().await.unwrap().is_empty());
    assert_eq!(store.sandbox_tests().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn budget_timeout_and_cancellation_both_tear_down() {
    // Blown wall-clock budget.
    let runtime = Arc::new(
        MockRuntime::new().with_exec_delay("bash /tmp/patch_script.sh", Duration::from_secs(60)),
    );
    let harness = SandboxHarness::new(
        runtime.clone(),
        MemoryStore::shared(),
        HarnessConfig {
            total_budget: Duration::from_millis(100),
            ..HarnessConfig::default()
        },
    );
    let test = harness.test_patch(&patch(), &web_asset()).await;
    assert_eq!(test.status, TestStatus::Errored);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(runtime.list_managed().await.unwrap().is_empty());

    // Caller cancellation.
    let runtime = Arc::new(
        MockRuntime::new().with_exec_delay("bash /tmp/patch_script.sh", Duration::from_secs(60)),
    );
    let harness = Arc::new(SandboxHarness::new(
        runtime.clone(),
        MemoryStore::shared(),
        HarnessConfig::default(),
    ));
    let task = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move { harness.test_patch(&patch(), &web_asset()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    task.abort();
    let _ = task.await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(runtime.list_managed().await.unwrap().is_empty());
}

#[tokio::test]
async fn passing_test_promotes_the_stored_patch() {
    let runtime = Arc::new(MockRuntime::new());
    let store = MemoryStore::shared();
    let harness = SandboxHarness::new(runtime, store.clone(), HarnessConfig::default());

    let p = patch();
    store.save_patch(p.clone()).await.unwrap();

    harness.test_patch(&p, &web_asset()).await;

    let stored = store.patch(&p.patch_id).await.unwrap();
    assert_eq!(stored.status, PatchStatus::TestPassed);
}

#[tokio::test]
async fn low_confidence_patch_cannot_reach_test_passed() {
    let runtime = Arc::new(MockRuntime::new());
    let store = MemoryStore::shared();
    let harness = SandboxHarness::new(runtime, store.clone(), HarnessConfig::default());

    let mut p = patch();
    p.confidence = 0.4;
    store.save_patch(p.clone()).await.unwrap();

    let test = harness.test_patch(&p, &web_asset()).await;
    assert_eq!(test.status, TestStatus::Passed, "the sandbox run itself passed");

    let stored = store.patch(&p.patch_id).await.unwrap();
    assert_ne!(
        stored.status,
        PatchStatus::TestPassed,
        "the promotion guard blocks low-confidence patches"
    );
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration_ms: 2,
    }
}

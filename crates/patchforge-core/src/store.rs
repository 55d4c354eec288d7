//! Persistence facade.
//!
//! The engine never assumes a concrete schema; it writes findings, patch
//! artifacts and sandbox tests through this narrow trait. Production
//! deployments back it with a database collaborator; tests and the daemon
//! stub use [`MemoryStore`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::{
    CoreError, EnrichedFinding, PatchArtifact, PatchStatus, Result, SandboxTest,
};

/// Narrow persistence contract consumed by the pipeline, the orchestrator
/// and the sandbox harness.
#[async_trait]
pub trait FindingStore: Send + Sync {
    /// Insert or update a finding, keyed by CVE id (or synthetic id).
    async fn upsert_finding(&self, finding: EnrichedFinding) -> Result<()>;

    /// Look up a finding by CVE id.
    async fn find_finding_by_cve(&self, cve_id: &str) -> Result<Option<EnrichedFinding>>;

    /// Insert a patch artifact.
    async fn save_patch(&self, patch: PatchArtifact) -> Result<()>;

    /// Update the status of a stored patch.
    async fn update_patch_status(&self, patch_id: &str, status: PatchStatus) -> Result<()>;

    /// Record a completed sandbox test.
    async fn save_sandbox_test(&self, test: SandboxTest) -> Result<()>;
}

/// In-memory store used by tests and the daemon stub.
#[derive(Default)]
pub struct MemoryStore {
    findings: RwLock<HashMap<String, EnrichedFinding>>,
    patches: RwLock<HashMap<String, PatchArtifact>>,
    tests: RwLock<Vec<SandboxTest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Dedup key for a finding: CVE id when present, else the scanner id.
    fn finding_key(finding: &EnrichedFinding) -> String {
        finding
            .finding
            .cve_id
            .clone()
            .unwrap_or_else(|| finding.finding.scanner_id.clone())
    }

    pub async fn finding_count(&self) -> usize {
        self.findings.read().await.len()
    }

    pub async fn patch(&self, patch_id: &str) -> Option<PatchArtifact> {
        self.patches.read().await.get(patch_id).cloned()
    }

    pub async fn sandbox_tests(&self) -> Vec<SandboxTest> {
        self.tests.read().await.clone()
    }
}

#[async_trait]
impl FindingStore for MemoryStore {
    async fn upsert_finding(&self, finding: EnrichedFinding) -> Result<()> {
        let key = Self::finding_key(&finding);
        self.findings.write().await.insert(key, finding);
        Ok(())
    }

    async fn find_finding_by_cve(&self, cve_id: &str) -> Result<Option<EnrichedFinding>> {
        Ok(self.findings.read().await.get(cve_id).cloned())
    }

    async fn save_patch(&self, patch: PatchArtifact) -> Result<()> {
        self.patches
            .write()
            .await
            .insert(patch.patch_id.clone(), patch);
        Ok(())
    }

    async fn update_patch_status(&self, patch_id: &str, status: PatchStatus) -> Result<()> {
        let mut patches = self.patches.write().await;
        let patch = patches
            .get_mut(patch_id)
            .ok_or_else(|| CoreError::PatchNotFound(patch_id.to_string()))?;
        patch.transition(status)?;
        Ok(())
    }

    async fn save_sandbox_test(&self, test: SandboxTest) -> Result<()> {
        self.tests.write().await.push(test);
        Ok(())
    }
}

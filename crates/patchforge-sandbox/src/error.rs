//! Sandbox error taxonomy.
//!
//! Harness failures never silently drop a test: every error path ends in
//! a persisted `SandboxTest` with status `errored` and a populated
//! issues list.

/// Sandbox errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Raw container-runtime failures (start, exec, copy, remove).
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Provisioning did not produce a usable sandbox.
    #[error("sandbox provisioning failed: {0}")]
    Provision(String),

    #[error("sandbox {stage} timed out after {seconds}s")]
    Timeout { stage: String, seconds: u64 },
}

impl SandboxError {
    /// Runtime failures during provisioning surface as provision errors.
    pub fn into_provision(self) -> Self {
        match self {
            SandboxError::Runtime(reason) => SandboxError::Provision(reason),
            other => other,
        }
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

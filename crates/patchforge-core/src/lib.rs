//! Patchforge Core Library
//!
//! Canonical domain models and shared infrastructure for the remediation
//! engine: finding and patch records, sandbox test results, priority
//! scoring, the persistence facade, configuration, and tracing setup.

pub mod config;
pub mod domain;
pub mod priority;
pub mod store;
pub mod telemetry;

pub use config::{ConfigError, SanitizationLevel, ScannerSourceConfig, Settings};

pub use domain::{
    AssetDescriptor, AssetRole, CoreError, EnrichedFinding, ExecutionResult, ExploitMaturity,
    FileMeta, HealthCheckResult, HealthReport, IssueSeverity, OsFamily, PackageChange,
    PackageManager, PatchArtifact, PatchRequest, PatchStatus, PatchStrategy, RawFinding, Result,
    SandboxTest, Severity, StateDiff, SystemState, TestStatus, ValidationIssue, ValidationReport,
};

pub use priority::{priority_score, PriorityWeights};

pub use store::{FindingStore, MemoryStore};

pub use telemetry::init_tracing;

/// Patchforge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

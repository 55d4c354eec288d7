//! Patchforge Sandbox Harness
//!
//! Provisions isolated container sandboxes mirroring a target asset,
//! executes candidate patch scripts with state capture before and after,
//! runs role-specific health checks, and analyzes the results into a
//! [`patchforge_core::SandboxTest`]. Containers are destroyed on every
//! exit path, including panics and cancellation.

pub mod analyzer;
pub mod error;
pub mod executor;
pub mod harness;
pub mod health;
pub mod image;
pub mod runtime;
pub mod state;
pub mod suite;

pub use analyzer::ResultAnalyzer;
pub use error::{Result, SandboxError};
pub use executor::PatchExecutor;
pub use harness::{HarnessConfig, SandboxHarness};
pub use image::image_for;
pub use runtime::{ContainerRuntime, ContainerSpec, DockerCliRuntime, ExecOutput, MockRuntime};
pub use state::{capture_state, diff_states};
pub use suite::{run_security_checks, run_smoke_checks};

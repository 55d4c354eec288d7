//! Exploit catalog lookups.
//!
//! The interface exists so real feeds (the CISA KEV catalog is the
//! intended source) can be plugged in; the shipped implementation is a
//! stub that reports no known exploits.

use async_trait::async_trait;

use patchforge_core::ExploitMaturity;

use crate::error::EnrichError;

/// Evidence of real-world exploitation for a CVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExploitEvidence {
    pub available: bool,
    pub maturity: ExploitMaturity,
    /// Listed in the known-exploited-vulnerabilities catalog.
    pub in_kev: bool,
}

/// Source of exploit-availability data.
#[async_trait]
pub trait ExploitCatalog: Send + Sync {
    async fn check(&self, cve_id: &str) -> Result<ExploitEvidence, EnrichError>;
}

/// Stub catalog: reports no exploits for anything.
///
/// TODO: replace with a CISA KEV feed client once the ingestion cadence
/// for the catalog is decided.
pub struct KevStubCatalog;

#[async_trait]
impl ExploitCatalog for KevStubCatalog {
    async fn check(&self, _cve_id: &str) -> Result<ExploitEvidence, EnrichError> {
        Ok(ExploitEvidence::default())
    }
}

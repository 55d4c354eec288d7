//! Patchforge Aggregator
//!
//! Ingestion and aggregation pipeline: scanner adapters behind a uniform
//! contract, concurrent fan-out fetching, deduplication of overlapping
//! reports, enrichment against NVD / EPSS / the exploit catalog, and
//! priority scoring. The output of a scan cycle is a set of enriched,
//! scored findings handed to the persistence facade.

pub mod adapter;
pub mod cache;
pub mod dedup;
pub mod enrich;
pub mod error;
pub mod pipeline;
pub mod scanners;

pub use adapter::{build_adapters, ScannerAdapter};
pub use cache::EnrichmentCache;
pub use dedup::Deduplicator;
pub use enrich::{
    CveMetadataSource, Enrichment, EnrichmentService, EpssClient, EpssScore, EpssSource,
    ExploitCatalog, ExploitEvidence, KevStubCatalog, NvdClient, NvdRecord,
};
pub use error::{EnrichError, ScannerError};
pub use pipeline::{ScanCycleReport, ScanPipeline, SourceOutcome};
pub use scanners::{MockAdapter, WazuhAdapter};

use anyhow::Result;
use std::sync::Arc;
use tracing::Level;

use patchforge_aggregator::{build_adapters, EnrichmentService, ScanPipeline};
use patchforge_core::{MemoryStore, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    patchforge_core::init_tracing(false, Level::INFO);

    let settings = Settings::from_env()?;
    tracing::info!(
        "patchforged stub started ({} scanner source(s) configured)",
        settings.scan_sources.len()
    );

    let adapters = build_adapters(&settings.scan_sources);
    if adapters.is_empty() {
        tracing::warn!("no scanner sources configured; set SCAN_SOURCES to enable scanning");
        return Ok(());
    }

    let pipeline = ScanPipeline::new(
        adapters,
        EnrichmentService::from_settings(&settings),
        Arc::new(MemoryStore::new()),
    );

    let report = pipeline.run_scan_cycle(None).await;
    tracing::info!(
        "scan cycle finished: {} unique finding(s) from {} source(s)",
        report.unique,
        report.sources.len()
    );

    Ok(())
}

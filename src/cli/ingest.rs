//! Ingest command implementation

use anyhow::Result;

use crate::adapter::AdapterRegistry;
use crate::config::Config;
use crate::identity::Device;
use crate::ingest::Orchestrator;
use crate::store::Store;

pub fn run(store: Store, config: &Config, device: Device) -> Result<()> {
    let registry = AdapterRegistry::new(config);
    let mut orchestrator =
        Orchestrator::new(store, registry, device, config.redaction.redact_secrets)?;

    println!("Scanning sources...\n");
    let summary = orchestrator.ingest_all()?;

    if summary.new_sources > 0 {
        println!("Registered {} new source(s)", summary.new_sources);
    }

    let mut total_inserted = 0usize;
    for outcome in &summary.outcomes {
        total_inserted += outcome.inserted;
        if outcome.inserted > 0 || outcome.status != "active" {
            println!(
                "  {:<8} {:>5} events  {}",
                outcome.status, outcome.inserted, outcome.locator
            );
        }
        if outcome.report.lines_skipped > 0 {
            println!(
                "           {} malformed line(s) skipped",
                outcome.report.lines_skipped
            );
        }
    }

    println!(
        "\n✅ Ingest complete: {} new events across {} sources",
        total_inserted,
        summary.outcomes.len()
    );
    Ok(())
}

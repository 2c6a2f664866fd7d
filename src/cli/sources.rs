//! Sources command implementation

use anyhow::{bail, Result};
use std::path::Path;

use super::{short_ts, truncate_display};
use crate::adapter::SourceKind;
use crate::config::Config;
use crate::identity::Device;
use crate::store::{SourceRegistration, Store};

pub fn list(store: &Store) -> Result<()> {
    let sources = store.list_sources(None)?;
    if sources.is_empty() {
        println!("No sources registered. Run 'recall ingest' to discover them.");
        return Ok(());
    }

    println!(
        "{:<22} {:<18} {:<8} {:<12} {}",
        "Source", "Kind", "Status", "Last seen", "Locator"
    );
    println!("{}", "-".repeat(100));
    for source in sources {
        println!(
            "{:<22} {:<18} {:<8} {:<12} {}",
            source.source_id,
            source.kind,
            source.status,
            source
                .last_seen_at
                .as_deref()
                .map(short_ts)
                .unwrap_or_else(|| "-".to_string()),
            truncate_display(&source.locator, 50),
        );
    }
    Ok(())
}

pub fn add(
    store: &Store,
    device: &Device,
    config: &Config,
    path: &str,
    kind: Option<&str>,
) -> Result<()> {
    let kind = match kind {
        Some(k) => SourceKind::parse(k)
            .ok_or_else(|| anyhow::anyhow!("unknown source kind: {k}"))?,
        None => infer_kind(Path::new(path))?,
    };

    let source = store.register_source(&SourceRegistration {
        kind: kind.as_str().to_string(),
        locator: path.to_string(),
        device_id: device.device_id.clone(),
        redact_secrets: config.redaction.redact_secrets,
    })?;
    println!("Registered {} as {}", path, source.source_id);
    Ok(())
}

pub fn remove(store: &mut Store, source_id: &str, purge: bool) -> Result<()> {
    if store.get_source(source_id)?.is_none() {
        bail!("no such source: {source_id}");
    }
    store.delete_source(source_id, purge)?;
    println!(
        "Removed {source_id}{}",
        if purge { " and its events" } else { "" }
    );
    Ok(())
}

pub fn pause(store: &Store, source_id: &str) -> Result<()> {
    if store.get_source(source_id)?.is_none() {
        bail!("no such source: {source_id}");
    }
    store.set_source_status(source_id, "paused", None)?;
    println!("Paused {source_id}");
    Ok(())
}

pub fn resume(store: &Store, source_id: &str) -> Result<()> {
    if store.get_source(source_id)?.is_none() {
        bail!("no such source: {source_id}");
    }
    store.set_source_status(source_id, "active", None)?;
    println!("Resumed {source_id}");
    Ok(())
}

fn infer_kind(path: &Path) -> Result<SourceKind> {
    if path.join(".git").exists() {
        return Ok(SourceKind::Git);
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("jsonl") => Ok(SourceKind::JsonlTranscript),
        Some("txt") => Ok(SourceKind::PlainTranscript),
        Some("json") => Ok(SourceKind::SplitTranscript),
        _ => bail!(
            "cannot infer source kind for {}; pass --kind",
            path.display()
        ),
    }
}

//! Edits command implementation

use anyhow::Result;

use super::{short_ts, truncate_display, FilterArgs};
use crate::store::query::EditFilters;
use crate::store::Store;

pub fn run(store: &Store, file: Option<String>, filters: &FilterArgs) -> Result<()> {
    let edits = store.get_edits(&EditFilters {
        since: filters.since.clone(),
        until: filters.until.clone(),
        project: filters.project.clone(),
        session: filters.session.clone(),
        file_path: file,
        limit: filters.limit,
    })?;

    if edits.is_empty() {
        println!("No edits recorded.");
        return Ok(());
    }

    for edit in &edits {
        println!(
            "{:<12} {:<40} -{} +{}",
            short_ts(&edit.event_ts),
            truncate_display(edit.file_path.as_deref().unwrap_or("-"), 40),
            edit.old_string.lines().count(),
            edit.new_string.lines().count(),
        );
    }
    println!("\n{} edit(s)", edits.len());
    Ok(())
}

//! Files command implementation

use anyhow::Result;

use super::{short_ts, truncate_display, FilterArgs};
use crate::store::Store;

pub fn run(store: &Store, filters: &FilterArgs) -> Result<()> {
    let files = store.list_accessed_files(&filters.to_query())?;

    if files.is_empty() {
        println!("No file activity recorded.");
        return Ok(());
    }

    println!(
        "{:<12} {:<7} {:<48} {}",
        "Last", "Count", "File", "Tools"
    );
    println!("{}", "-".repeat(90));
    for file in &files {
        println!(
            "{:<12} {:<7} {:<48} {}",
            short_ts(&file.last_accessed),
            file.access_count,
            truncate_display(&file.file_path, 48),
            file.tools_used.join(","),
        );
    }
    Ok(())
}

//! Search command implementation

use anyhow::Result;

use super::{short_ts, truncate_display, FilterArgs};
use crate::store::Store;

pub fn run(store: &Store, query: &str, filters: &FilterArgs) -> Result<()> {
    let response = store.search(query, &filters.to_query())?;

    if response.hits.is_empty() {
        println!("No matches.");
        return Ok(());
    }

    println!(
        "{:<12} {:<18} {:<7} {}",
        "Timestamp", "Type", "Score", "Text"
    );
    println!("{}", "-".repeat(90));
    for hit in &response.hits {
        let text = hit
            .event
            .text_redacted
            .as_deref()
            .or(hit.event.tool_name.as_deref())
            .unwrap_or("-");
        println!(
            "{:<12} {:<18} {:<7.2} {}",
            short_ts(&hit.event.event_ts),
            hit.event.event_type,
            hit.score,
            truncate_display(text, 50),
        );
    }

    println!(
        "\n{} of {} matches (next offset: {})",
        response.hits.len(),
        response.total,
        response.next_offset
    );
    Ok(())
}

//! Timeline command implementation

use anyhow::Result;

use super::{short_ts, truncate_display, FilterArgs};
use crate::store::Store;

pub fn run(store: &Store, filters: &FilterArgs) -> Result<()> {
    let response = store.timeline(&filters.to_query())?;

    if response.events.is_empty() {
        println!("No events in range.");
        return Ok(());
    }

    for event in &response.events {
        let text = event
            .text_redacted
            .as_deref()
            .or(event.tool_name.as_deref())
            .unwrap_or("-");
        let session = event.session_id.as_deref().unwrap_or("-");
        println!(
            "{:<12} {:<18} {:<12} {}",
            short_ts(&event.event_ts),
            event.event_type,
            truncate_display(session, 12),
            truncate_display(text, 46),
        );
    }

    let s = &response.summary;
    let counts: Vec<String> = s
        .counts_by_type
        .iter()
        .map(|(t, n)| format!("{n} {t}"))
        .collect();
    println!("\n{} events total ({})", response.total, counts.join(", "));
    if s.commit_count > 0 {
        println!(
            "{} commits, +{} -{}",
            s.commit_count, s.insertions, s.deletions
        );
    }
    Ok(())
}

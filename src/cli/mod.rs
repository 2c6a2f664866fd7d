//! CLI command implementations, one module per subcommand.

pub mod edits;
pub mod files;
pub mod ingest;
pub mod reconstruct;
pub mod search;
pub mod sources;
pub mod stats;
pub mod status;
pub mod timeline;
pub mod watch;

use crate::store::query::QueryFilters;

/// Shared filter flags accepted by the query subcommands.
#[derive(Debug, clap::Args)]
pub struct FilterArgs {
    /// Inclusive lower time bound (unix seconds, "2d", "3 days ago", ISO-8601)
    #[arg(long)]
    pub since: Option<String>,

    /// Inclusive upper time bound
    #[arg(long)]
    pub until: Option<String>,

    /// Project id, name, path, or pattern with `*`
    #[arg(long)]
    pub project: Option<String>,

    /// Session id, or pattern with `*`
    #[arg(long)]
    pub session: Option<String>,

    /// Event type filter (repeatable)
    #[arg(long = "type")]
    pub event_types: Vec<String>,

    /// Tool name filter (repeatable, `*` wildcards allowed)
    #[arg(long = "tool")]
    pub tool_names: Vec<String>,

    /// Role shorthand: user or assistant
    #[arg(long)]
    pub role: Option<String>,

    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    #[arg(long, default_value_t = 0)]
    pub offset: usize,
}

impl FilterArgs {
    pub fn to_query(&self) -> QueryFilters {
        QueryFilters {
            since: self.since.clone(),
            until: self.until.clone(),
            project: self.project.clone(),
            session: self.session.clone(),
            event_types: self.event_types.clone(),
            tool_names: self.tool_names.clone(),
            role: self.role.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Compact "MM-DD HH:MM" rendering of a stored timestamp.
pub(crate) fn short_ts(ts: &str) -> String {
    if ts.len() >= 16 {
        format!("{} {}", &ts[5..10], &ts[11..16])
    } else {
        ts.to_string()
    }
}

/// First line, truncated for table output.
pub(crate) fn truncate_display(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    if first_line.chars().count() > max {
        let cut: String = first_line.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        first_line.to_string()
    }
}

//! Query primitives over the event store: full-text search, timelines,
//! edit streams, per-file history and accessed-file rollups.
//!
//! All primitives share one filter language: inclusive `since`/`until`
//! bounds compared as datetimes, project/session identifiers with `*`
//! wildcards, and limit/offset pagination that also reports the
//! unpaginated total.

use anyhow::Result;
use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{row_to_event, EventRow, Store, EVENT_COLUMNS};
use crate::timeutil;

/// Tool names treated as file reads when resolving snapshots.
pub const READ_TOOLS: &[&str] = &["read", "read_file", "view", "cat"];
/// Tool names treated as file writes.
pub const WRITE_TOOLS: &[&str] = &["write", "write_file", "create_file"];
/// The edit-tool identifier (case-insensitive).
pub const EDIT_TOOL: &str = "edit";

/// Argument key names commonly carrying a file path.
const PATH_KEYS: &[&str] = &["file_path", "filePath", "path"];
const OLD_KEYS: &[&str] = &["old_string", "oldString"];
const NEW_KEYS: &[&str] = &["new_string", "newString"];

/// Shared filter language.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub since: Option<String>,
    pub until: Option<String>,
    pub project: Option<String>,
    pub session: Option<String>,
    pub event_types: Vec<String>,
    pub tool_names: Vec<String>,
    pub role: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl QueryFilters {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct SearchHit {
    pub event: EventRow,
    /// Negated BM25: higher is better.
    pub score: f64,
}

#[derive(Debug)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub total: i64,
    /// Offset of the next page.
    pub next_offset: usize,
}

#[derive(Debug, Default)]
pub struct TimelineSummary {
    pub counts_by_type: BTreeMap<String, i64>,
    pub commit_count: i64,
    pub insertions: i64,
    pub deletions: i64,
}

#[derive(Debug)]
pub struct TimelineResponse {
    pub events: Vec<EventRow>,
    pub total: i64,
    pub summary: TimelineSummary,
}

/// One edit parsed out of a `tool_call` event.
#[derive(Debug, Clone)]
pub struct EditRecord {
    pub event_id: String,
    pub event_ts: String,
    pub session_id: Option<String>,
    pub file_path: Option<String>,
    pub old_string: String,
    pub new_string: String,
}

#[derive(Debug, Clone, Default)]
pub struct EditFilters {
    pub since: Option<String>,
    pub until: Option<String>,
    pub project: Option<String>,
    pub session: Option<String>,
    pub file_path: Option<String>,
    pub limit: usize,
}

/// A captured read/write snapshot of a file.
#[derive(Debug)]
pub struct FileSnapshot {
    pub event: EventRow,
    pub content: String,
}

#[derive(Debug)]
pub struct AccessedFile {
    pub file_path: String,
    pub last_accessed: String,
    pub access_count: i64,
    pub tools_used: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────
// FTS query normalization
// ─────────────────────────────────────────────────────────────────────

/// Rewrite a raw user query into an FTS5 MATCH expression.
///
/// Escaped pipes are unescaped, parenthesized groups flattened, `|` becomes
/// OR and a literal AND becomes plain adjacency; slashes and regex
/// metacharacters are stripped; each remaining term is quoted unless it is
/// purely word characters; terms join with OR.
pub fn build_match_query(raw: &str) -> String {
    let mut q = raw.replace("\\|", "|");
    q = q.replace(['(', ')'], " ");
    q = q.replace('|', " OR ");

    let cleaned: String = q
        .chars()
        .map(|c| match c {
            '/' | '\\' | '*' | '+' | '?' | '[' | ']' | '^' | '$' | '{' | '}' | '.' => ' ',
            _ => c,
        })
        .collect();

    let mut terms: Vec<String> = Vec::new();
    for term in cleaned.split_whitespace() {
        if term.eq_ignore_ascii_case("or") || term.eq_ignore_ascii_case("and") {
            continue;
        }
        if term.len() >= 2 && term.starts_with('"') && term.ends_with('"') {
            terms.push(term.to_string());
        } else if term.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            terms.push(term.to_string());
        } else {
            terms.push(format!("\"{}\"", term.replace('"', "\"\"")));
        }
    }
    terms.join(" OR ")
}

// ─────────────────────────────────────────────────────────────────────
// Filter compilation
// ─────────────────────────────────────────────────────────────────────

fn wildcard_to_like(input: &str) -> Option<String> {
    if input.contains('*') || input.contains('%') {
        Some(input.replace('*', "%"))
    } else {
        None
    }
}

/// Resolve a project identifier through the lookup chain: exact id, exact
/// display name, exact root path, id prefix, display-name substring, then
/// longest root-path prefix of the input.
fn resolve_project(store: &Store, input: &str) -> Option<String> {
    let conn = store.conn();
    let exact = |sql: &str| -> Option<String> {
        conn.query_row(sql, [input], |r| r.get(0)).optional().ok()?
    };

    exact("SELECT project_id FROM projects WHERE project_id = ?")
        .or_else(|| exact("SELECT project_id FROM projects WHERE display_name = ?"))
        .or_else(|| exact("SELECT project_id FROM projects WHERE root_path = ?"))
        .or_else(|| {
            conn.query_row(
                "SELECT project_id FROM projects WHERE project_id LIKE ? || '%' LIMIT 1",
                [input],
                |r| r.get(0),
            )
            .optional()
            .ok()?
        })
        .or_else(|| {
            conn.query_row(
                "SELECT project_id FROM projects WHERE display_name LIKE '%' || ? || '%' LIMIT 1",
                [input],
                |r| r.get(0),
            )
            .optional()
            .ok()?
        })
        .or_else(|| {
            conn.query_row(
                "SELECT project_id FROM projects WHERE ? LIKE root_path || '%'
                 ORDER BY LENGTH(root_path) DESC LIMIT 1",
                [input],
                |r| r.get(0),
            )
            .optional()
            .ok()?
        })
}

struct Compiled {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

fn compile_filters(store: &Store, filters: &QueryFilters) -> Compiled {
    let now = Utc::now();
    let mut clauses = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(since) = filters.since.as_deref().and_then(|s| timeutil::parse_to_rfc3339(s, now)) {
        clauses.push("datetime(e.event_ts) >= datetime(?)".to_string());
        params.push(SqlValue::Text(since));
    }
    if let Some(until) = filters.until.as_deref().and_then(|s| timeutil::parse_to_rfc3339(s, now)) {
        clauses.push("datetime(e.event_ts) <= datetime(?)".to_string());
        params.push(SqlValue::Text(until));
    }

    if let Some(project) = filters.project.as_deref() {
        if let Some(pattern) = wildcard_to_like(project) {
            clauses.push("e.project_id LIKE ?".to_string());
            params.push(SqlValue::Text(pattern));
        } else {
            let resolved = resolve_project(store, project).unwrap_or_else(|| project.to_string());
            clauses.push("e.project_id = ?".to_string());
            params.push(SqlValue::Text(resolved));
        }
    }

    if let Some(session) = filters.session.as_deref() {
        if let Some(pattern) = wildcard_to_like(session) {
            clauses.push("e.session_id LIKE ?".to_string());
            params.push(SqlValue::Text(pattern));
        } else {
            clauses.push("e.session_id = ?".to_string());
            params.push(SqlValue::Text(session.to_string()));
        }
    }

    let mut event_types = filters.event_types.clone();
    match filters.role.as_deref() {
        Some("user") => event_types.push("user_message".to_string()),
        Some("assistant") => event_types.push("assistant_message".to_string()),
        _ => {}
    }
    if !event_types.is_empty() {
        let placeholders = vec!["?"; event_types.len()].join(", ");
        clauses.push(format!("e.event_type IN ({placeholders})"));
        for t in event_types {
            params.push(SqlValue::Text(t));
        }
    }

    if !filters.tool_names.is_empty() {
        let any_wildcard = filters
            .tool_names
            .iter()
            .any(|t| t.contains('*') || t.contains('%'));
        if any_wildcard {
            let likes = vec!["e.tool_name LIKE ?"; filters.tool_names.len()].join(" OR ");
            clauses.push(format!("({likes})"));
            for t in &filters.tool_names {
                params.push(SqlValue::Text(t.replace('*', "%")));
            }
        } else {
            let placeholders = vec!["?"; filters.tool_names.len()].join(", ");
            clauses.push(format!("e.tool_name IN ({placeholders})"));
            for t in &filters.tool_names {
                params.push(SqlValue::Text(t.clone()));
            }
        }
    }

    Compiled { clauses, params }
}

fn where_sql(compiled: &Compiled, extra: &[&str]) -> String {
    let mut all: Vec<String> = extra.iter().map(|s| s.to_string()).collect();
    all.extend(compiled.clauses.iter().cloned());
    if all.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", all.join(" AND "))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Primitives
// ─────────────────────────────────────────────────────────────────────

impl Store {
    /// Full-text search ranked by BM25 (best first).
    pub fn search(&self, query: &str, filters: &QueryFilters) -> Result<SearchResponse> {
        let match_query = build_match_query(query);
        if match_query.is_empty() {
            return Ok(SearchResponse {
                hits: Vec::new(),
                total: 0,
                next_offset: filters.offset,
            });
        }

        let compiled = compile_filters(self, filters);
        let where_clause = where_sql(&compiled, &["events_fts MATCH ?"]);

        let mut params: Vec<SqlValue> = vec![SqlValue::Text(match_query)];
        params.extend(compiled.params.iter().cloned());

        let total: i64 = self.conn().query_row(
            &format!(
                "SELECT COUNT(*)
                 FROM events_fts JOIN events e ON e.rowid = events_fts.rowid
                 {where_clause}"
            ),
            params_from_iter(params.iter()),
            |r| r.get(0),
        )?;

        let limit = if filters.limit == 0 { 50 } else { filters.limit };
        let sql = format!(
            "SELECT {EVENT_COLUMNS}, bm25(events_fts) AS bm25_rank
             FROM events_fts JOIN events e ON e.rowid = events_fts.rowid
             {where_clause}
             ORDER BY bm25_rank ASC
             LIMIT ? OFFSET ?"
        );
        params.push(SqlValue::Integer(limit as i64));
        params.push(SqlValue::Integer(filters.offset as i64));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            let event = row_to_event(row)?;
            let rank: f64 = row.get(16)?;
            Ok(SearchHit {
                event,
                score: -rank,
            })
        })?;
        let hits: Vec<SearchHit> = rows.collect::<std::result::Result<_, _>>()?;
        let next_offset = filters.offset + hits.len();

        Ok(SearchResponse {
            hits,
            total,
            next_offset,
        })
    }

    /// Chronological event listing with summary aggregates.
    pub fn timeline(&self, filters: &QueryFilters) -> Result<TimelineResponse> {
        let compiled = compile_filters(self, filters);
        let where_clause = where_sql(&compiled, &[]);

        let total: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM events e {where_clause}"),
            params_from_iter(compiled.params.iter()),
            |r| r.get(0),
        )?;

        let mut summary = TimelineSummary::default();
        {
            let mut stmt = self.conn().prepare(&format!(
                "SELECT e.event_type, COUNT(*) FROM events e {where_clause} GROUP BY e.event_type"
            ))?;
            let rows = stmt.query_map(params_from_iter(compiled.params.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (event_type, count) = row?;
                summary.counts_by_type.insert(event_type, count);
            }
        }
        summary.commit_count = summary
            .counts_by_type
            .get("git_commit")
            .copied()
            .unwrap_or(0);
        {
            let commit_where = if where_clause.is_empty() {
                "WHERE e.event_type = 'git_commit'".to_string()
            } else {
                format!("{where_clause} AND e.event_type = 'git_commit'")
            };
            let (ins, del): (i64, i64) = self.conn().query_row(
                &format!(
                    "SELECT COALESCE(SUM(json_extract(e.meta_json, '$.insertions')), 0),
                            COALESCE(SUM(json_extract(e.meta_json, '$.deletions')), 0)
                     FROM events e {commit_where}"
                ),
                params_from_iter(compiled.params.iter()),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            summary.insertions = ins;
            summary.deletions = del;
        }

        let limit = if filters.limit == 0 { 100 } else { filters.limit };
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e {where_clause}
             ORDER BY datetime(e.event_ts) ASC, e.source_id, e.source_seq ASC
             LIMIT ? OFFSET ?"
        );
        let mut params = compiled.params.clone();
        params.push(SqlValue::Integer(limit as i64));
        params.push(SqlValue::Integer(filters.offset as i64));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), row_to_event)?;
        let events: Vec<EventRow> = rows.collect::<std::result::Result<_, _>>()?;

        Ok(TimelineResponse {
            events,
            total,
            summary,
        })
    }

    /// Edit-tool calls, ascending by time, with parsed arguments.
    pub fn get_edits(&self, filters: &EditFilters) -> Result<Vec<EditRecord>> {
        let query_filters = QueryFilters {
            since: filters.since.clone(),
            until: filters.until.clone(),
            project: filters.project.clone(),
            session: filters.session.clone(),
            ..Default::default()
        };
        let compiled = compile_filters(self, &query_filters);
        let where_clause = where_sql(
            &compiled,
            &["e.event_type = 'tool_call'", "LOWER(e.tool_name) = 'edit'"],
        );

        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e {where_clause}
             ORDER BY datetime(e.event_ts) ASC, e.source_id, e.source_seq ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(compiled.params.iter()), row_to_event)?;

        let limit = if filters.limit == 0 {
            usize::MAX
        } else {
            filters.limit
        };
        let mut edits = Vec::new();
        for row in rows {
            let event = row?;
            let args = match event.tool_args() {
                Some(a) => a,
                None => continue,
            };
            let file_path = first_string(&args, PATH_KEYS);
            if let Some(filter) = filters.file_path.as_deref() {
                let matched = file_path
                    .as_deref()
                    .map(|p| p.contains(filter))
                    .unwrap_or(false);
                if !matched {
                    continue;
                }
            }
            let old_string = first_string(&args, OLD_KEYS).unwrap_or_default();
            let new_string = first_string(&args, NEW_KEYS).unwrap_or_default();
            edits.push(EditRecord {
                event_id: event.event_id.clone(),
                event_ts: event.event_ts.clone(),
                session_id: event.session_id.clone(),
                file_path,
                old_string,
                new_string,
            });
            if edits.len() >= limit {
                break;
            }
        }
        Ok(edits)
    }

    /// Most recent read/write snapshot of a file, optionally bounded in time.
    pub fn get_latest_file_content(
        &self,
        file_path: &str,
        before: Option<&str>,
    ) -> Result<Option<FileSnapshot>> {
        let mut snapshots = self.file_snapshots(file_path, None, before, true, 1)?;
        Ok(snapshots.pop())
    }

    /// Time-ordered (ascending) read/write snapshot history for a path.
    pub fn get_file_history(
        &self,
        file_path: &str,
        since: Option<&str>,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FileSnapshot>> {
        let limit = if limit == 0 { 100 } else { limit };
        let mut snaps = self.file_snapshots(file_path, since, until, true, limit)?;
        snaps.reverse();
        Ok(snaps)
    }

    /// Most recent *substantially complete* read of a path: at least 1000
    /// bytes and ending on a structural character, so reconstruction never
    /// seeds from a mid-line truncation.
    pub fn find_read_result(
        &self,
        file_path: &str,
        before: Option<&str>,
    ) -> Result<Option<FileSnapshot>> {
        let candidates = self.file_snapshots(file_path, None, before, false, 200)?;
        for snap in candidates {
            if is_substantially_complete(&snap.content) {
                return Ok(Some(snap));
            }
        }
        Ok(None)
    }

    /// Shared snapshot lookup. Results come back descending by time.
    fn file_snapshots(
        &self,
        file_path: &str,
        since: Option<&str>,
        until: Option<&str>,
        include_writes: bool,
        limit: usize,
    ) -> Result<Vec<FileSnapshot>> {
        let now = Utc::now();
        let mut clauses = vec!["e.event_type = 'tool_result'".to_string()];
        let mut params: Vec<SqlValue> = Vec::new();

        let mut tools: Vec<&str> = READ_TOOLS.to_vec();
        if include_writes {
            tools.extend_from_slice(WRITE_TOOLS);
            tools.push(EDIT_TOOL);
        }
        let placeholders = vec!["?"; tools.len()].join(", ");
        let tool_clause = format!("LOWER(e.tool_name) IN ({placeholders})");
        let tool_params: Vec<SqlValue> = tools
            .iter()
            .map(|t| SqlValue::Text(t.to_string()))
            .collect();

        // A result refers to the file either via its own captured paths or
        // via the paired call's arguments (joined on tool_call_id).
        clauses.push(format!(
            "{tool_clause} AND (e.file_paths LIKE '%' || ? || '%'
              OR EXISTS (
                 SELECT 1 FROM events c
                 WHERE c.event_type = 'tool_call'
                   AND c.source_id = e.source_id
                   AND json_extract(c.meta_json, '$.tool_call_id') =
                       json_extract(e.meta_json, '$.tool_call_id')
                   AND json_extract(e.meta_json, '$.tool_call_id') IS NOT NULL
                   AND c.tool_args_json LIKE '%' || ? || '%'))"
        ));
        params.extend(tool_params);
        params.push(SqlValue::Text(file_path.to_string()));
        params.push(SqlValue::Text(file_path.to_string()));

        if let Some(since) = since.and_then(|s| timeutil::parse_to_rfc3339(s, now)) {
            clauses.push("datetime(e.event_ts) >= datetime(?)".to_string());
            params.push(SqlValue::Text(since));
        }
        if let Some(until) = until.and_then(|s| timeutil::parse_to_rfc3339(s, now)) {
            clauses.push("datetime(e.event_ts) <= datetime(?)".to_string());
            params.push(SqlValue::Text(until));
        }

        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e
             WHERE {}
             ORDER BY datetime(e.event_ts) DESC, e.source_seq DESC
             LIMIT ?",
            clauses.join(" AND ")
        );
        params.push(SqlValue::Integer(limit as i64));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), row_to_event)?;

        let mut snapshots = Vec::new();
        for row in rows {
            let event = row?;
            if let Some(content) = event.text_redacted.clone() {
                snapshots.push(FileSnapshot { event, content });
            }
        }
        Ok(snapshots)
    }

    /// Group tool calls by referenced file path.
    pub fn list_accessed_files(&self, filters: &QueryFilters) -> Result<Vec<AccessedFile>> {
        let compiled = compile_filters(self, filters);
        let where_clause = where_sql(&compiled, &["e.event_type = 'tool_call'"]);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e {where_clause}
             ORDER BY datetime(e.event_ts) ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(compiled.params.iter()), row_to_event)?;

        let mut grouped: BTreeMap<String, AccessedFile> = BTreeMap::new();
        for row in rows {
            let event = row?;
            let path = event
                .tool_args()
                .as_ref()
                .and_then(|args| first_string(args, PATH_KEYS))
                .or_else(|| event.file_paths().into_iter().next());
            let Some(path) = path else { continue };
            let tool = event.tool_name.clone().unwrap_or_default();

            let entry = grouped.entry(path.clone()).or_insert_with(|| AccessedFile {
                file_path: path,
                last_accessed: event.event_ts.clone(),
                access_count: 0,
                tools_used: Vec::new(),
            });
            entry.access_count += 1;
            if event.event_ts > entry.last_accessed {
                entry.last_accessed = event.event_ts.clone();
            }
            if !tool.is_empty() && !entry.tools_used.contains(&tool) {
                entry.tools_used.push(tool);
            }
        }

        let mut out: Vec<AccessedFile> = grouped.into_values().collect();
        out.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        if filters.limit > 0 {
            out.truncate(filters.limit);
        }
        Ok(out)
    }

    /// Events carrying token usage metadata, for aggregation.
    pub fn events_with_tokens(&self, filters: &QueryFilters) -> Result<Vec<EventRow>> {
        let compiled = compile_filters(self, filters);
        let where_clause = where_sql(
            &compiled,
            &["json_extract(e.meta_json, '$.tokens') IS NOT NULL"],
        );
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e {where_clause}
             ORDER BY datetime(e.event_ts) ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(compiled.params.iter()), row_to_event)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    None
}

/// At least 1000 bytes and a structural terminator; anything else is likely
/// a mid-write truncation.
pub fn is_substantially_complete(content: &str) -> bool {
    if content.len() < 1000 {
        return false;
    }
    matches!(content.chars().last(), Some('}') | Some(')') | Some('`') | Some('\n'))
}

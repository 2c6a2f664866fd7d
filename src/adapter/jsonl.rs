//! Line-delimited JSON transcript adapter.
//!
//! Layout: one JSON object per line, files under a per-project directory,
//! file name encoding the session id (`<base>/<project>/<session>.jsonl`).
//! Ingestion tails each file from a byte cursor with rotation detection and
//! normalizes user/assistant turns, content blocks and legacy XML-embedded
//! tool invocations into canonical events.

use anyhow::Result;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::{
    truncate_capture, Cursor, EventDraft, EventType, IngestOutput, IngestReport,
    NormalizeContext, SourceAdapter, SourceCandidate, SourceKind, MAX_FILE_CAPTURE,
    MAX_TOOL_OUTPUT,
};
use crate::error::IngestError;
use crate::timeutil;

pub struct JsonlAdapter {
    base_path: PathBuf,
}

impl JsonlAdapter {
    pub fn new(custom_path: Option<PathBuf>) -> Self {
        let base_path = custom_path.unwrap_or_else(|| {
            let home = dirs::home_dir().unwrap_or_default();
            home.join(".claude/projects")
        });
        Self { base_path }
    }

    /// Read the working directory recorded on the first parseable line.
    fn peek_cwd(path: &Path) -> Option<PathBuf> {
        let content = std::fs::read_to_string(path).ok()?;
        for line in content.lines().take(20) {
            if let Ok(json) = serde_json::from_str::<Value>(line) {
                if let Some(cwd) = json.get("cwd").and_then(|v| v.as_str()) {
                    return Some(PathBuf::from(cwd));
                }
            }
        }
        None
    }
}

impl SourceAdapter for JsonlAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::JsonlTranscript
    }

    fn discover(&self) -> Result<Vec<SourceCandidate>> {
        let mut candidates = vec![];
        if !self.base_path.exists() {
            return Ok(candidates);
        }

        for project_entry in std::fs::read_dir(&self.base_path)? {
            let project_dir = project_entry?.path();
            if !project_dir.is_dir() {
                continue;
            }
            for file_entry in std::fs::read_dir(&project_dir)? {
                let file_path = file_entry?.path();
                if file_path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                    let session_id = file_path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or("unknown")
                        .to_string();
                    candidates.push(SourceCandidate {
                        kind: SourceKind::JsonlTranscript,
                        locator: file_path.to_string_lossy().to_string(),
                        session_id: Some(session_id),
                        project_dir: Self::peek_cwd(&file_path),
                    });
                }
            }
        }
        Ok(candidates)
    }

    fn working_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs: Vec<PathBuf> = vec![];
        for candidate in self.discover()? {
            if let Some(dir) = candidate.project_dir {
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
        }
        Ok(dirs)
    }

    fn ingest(
        &self,
        locator: &str,
        cursor: Option<&Cursor>,
        ctx: &NormalizeContext,
    ) -> Result<IngestOutput, IngestError> {
        let path = Path::new(locator);
        let metadata = std::fs::metadata(path)
            .map_err(|_| IngestError::missing(format!("transcript vanished: {locator}")))?;

        let inode = file_inode(&metadata);
        let size = metadata.len() as i64;
        let mtime = file_mtime(&metadata);

        // Rotation: inode changed or the recorded offset ran past the file.
        let start_offset = match cursor {
            Some(c) => {
                let rotated = (c.file_inode.is_some() && c.file_inode != inode)
                    || c.byte_offset.map(|o| o > size).unwrap_or(false);
                if rotated {
                    0
                } else {
                    c.byte_offset.unwrap_or(0)
                }
            }
            None => 0,
        };

        let mut next_seq = cursor.and_then(|c| c.last_rowid).unwrap_or(0) + 1;
        let mut report = IngestReport::default();
        let mut events = vec![];
        let mut consumed = 0usize;

        if start_offset < size {
            let mut file = std::fs::File::open(path)?;
            file.seek(SeekFrom::Start(start_offset as u64))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;

            // Only complete (newline-terminated) lines move the cursor; a
            // half-written tail line is picked up on the next tick.
            let text = String::from_utf8_lossy(&buf);
            let mut pairs: HashMap<String, (f64, String)> = HashMap::new();
            let mut pos = 0usize;
            while let Some(nl) = text[pos..].find('\n') {
                let line = &text[pos..pos + nl];
                pos += nl + 1;
                consumed = pos;

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(entry) => {
                        normalize_entry(&entry, &mut next_seq, &mut pairs, &mut events);
                    }
                    Err(_) => {
                        tracing::debug!(locator, "skipping malformed transcript line");
                        report.lines_skipped += 1;
                    }
                }
            }
        }

        report.events_emitted = events.len();
        let new_cursor = Cursor {
            source_id: ctx.source_id.clone(),
            file_inode: inode,
            file_size: Some(size),
            file_mtime: mtime,
            byte_offset: Some(start_offset + consumed as i64),
            diff_mtime: None,
            last_event_id: None,
            last_rowid: Some(next_seq - 1),
            updated_at: None,
        };

        Ok(IngestOutput {
            events,
            new_cursor,
            report,
        })
    }
}

/// Normalize one transcript entry into zero or more event drafts.
fn normalize_entry(
    entry: &Value,
    next_seq: &mut i64,
    pairs: &mut HashMap<String, (f64, String)>,
    events: &mut Vec<EventDraft>,
) {
    let entry_type = entry.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if entry_type == "queue-operation" || entry_type == "summary" {
        return;
    }

    let role = entry
        .get("message")
        .and_then(|m| m.get("role"))
        .and_then(|v| v.as_str())
        .or(Some(entry_type))
        .unwrap_or("");

    let ts = entry
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(timeutil::normalize_source_ts)
        .unwrap_or_else(|| timeutil::to_rfc3339_z(&chrono::Utc::now()));

    let message_id = entry
        .get("uuid")
        .and_then(|v| v.as_str())
        .map(String::from);

    let content = entry.get("message").and_then(|m| m.get("content"));

    match role {
        "user" => normalize_user_turn(content, &ts, message_id, next_seq, pairs, events),
        "assistant" => {
            let model = entry
                .get("message")
                .and_then(|m| m.get("model"))
                .and_then(|v| v.as_str())
                .map(String::from);
            let tokens = entry
                .get("message")
                .and_then(|m| m.get("usage"))
                .map(|usage| {
                    json!({
                        "input": usage.get("input_tokens").and_then(Value::as_i64),
                        "output": usage.get("output_tokens").and_then(Value::as_i64),
                        "cache_read": usage.get("cache_read_input_tokens").and_then(Value::as_i64),
                        "cache_write": usage.get("cache_creation_input_tokens").and_then(Value::as_i64),
                    })
                });
            normalize_assistant_turn(content, &ts, message_id, model, tokens, next_seq, pairs, events);
        }
        _ => {}
    }
}

fn normalize_user_turn(
    content: Option<&Value>,
    ts: &str,
    message_id: Option<String>,
    next_seq: &mut i64,
    pairs: &mut HashMap<String, (f64, String)>,
    events: &mut Vec<EventDraft>,
) {
    let Some(content) = content else { return };

    if let Some(text) = content.as_str() {
        if !text.trim().is_empty() {
            let seq = alloc(next_seq);
            let mut draft = EventDraft::new(seq, ts.to_string(), EventType::UserMessage);
            draft.text = Some(truncate_capture(text, MAX_TOOL_OUTPUT));
            draft.meta = message_id.map(|id| json!({"message_id": id}));
            events.push(draft);
        }
        return;
    }

    let Some(blocks) = content.as_array() else { return };
    let mut text_parts: Vec<&str> = vec![];
    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(t);
                }
            }
            Some("tool_result") => {
                let call_id = block
                    .get("tool_use_id")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                let output = tool_result_text(block);
                let (seq, tool_name) = match call_id.as_deref().and_then(|id| pairs.get(id)) {
                    Some((call_seq, name)) => (call_seq + 0.5, Some(name.clone())),
                    None => (alloc(next_seq), None),
                };
                let cap = if tool_name
                    .as_deref()
                    .map(super::is_file_tool)
                    .unwrap_or(false)
                {
                    MAX_FILE_CAPTURE
                } else {
                    MAX_TOOL_OUTPUT
                };
                let mut draft = EventDraft::new(seq, ts.to_string(), EventType::ToolResult);
                draft.text = Some(truncate_capture(&output, cap));
                draft.tool_name = tool_name;
                let mut meta = serde_json::Map::new();
                if let Some(id) = call_id {
                    meta.insert("tool_call_id".into(), Value::String(id));
                }
                if !meta.is_empty() {
                    draft.meta = Some(Value::Object(meta));
                }
                events.push(draft);
            }
            _ => {}
        }
    }

    if !text_parts.is_empty() {
        let seq = alloc(next_seq);
        let mut draft = EventDraft::new(seq, ts.to_string(), EventType::UserMessage);
        draft.text = Some(truncate_capture(&text_parts.join("\n"), MAX_TOOL_OUTPUT));
        draft.meta = message_id.map(|id| json!({"message_id": id}));
        events.push(draft);
    }
}

#[allow(clippy::too_many_arguments)]
fn normalize_assistant_turn(
    content: Option<&Value>,
    ts: &str,
    message_id: Option<String>,
    model: Option<String>,
    tokens: Option<Value>,
    next_seq: &mut i64,
    pairs: &mut HashMap<String, (f64, String)>,
    events: &mut Vec<EventDraft>,
) {
    let Some(content) = content else { return };
    let mut tokens = tokens;

    if let Some(text) = content.as_str() {
        emit_assistant_text(
            text, ts, &message_id, &model, &mut tokens, next_seq, pairs, events,
        );
        return;
    }

    let Some(blocks) = content.as_array() else { return };
    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    emit_assistant_text(
                        t, ts, &message_id, &model, &mut tokens, next_seq, pairs, events,
                    );
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let call_id = block.get("id").and_then(|v| v.as_str()).map(String::from);
                let args = block.get("input").cloned().unwrap_or(Value::Null);
                let seq = alloc(next_seq);
                if let Some(id) = &call_id {
                    pairs.insert(id.clone(), (seq, name.clone()));
                }
                push_tool_call(seq, ts, &name, args, call_id, events);
            }
            _ => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_assistant_text(
    text: &str,
    ts: &str,
    message_id: &Option<String>,
    model: &Option<String>,
    tokens: &mut Option<Value>,
    next_seq: &mut i64,
    pairs: &mut HashMap<String, (f64, String)>,
    events: &mut Vec<EventDraft>,
) {
    let remaining = parse_legacy_invocations(text, ts, next_seq, pairs, events);
    if remaining.trim().is_empty() {
        return;
    }
    let seq = alloc(next_seq);
    let mut draft = EventDraft::new(seq, ts.to_string(), EventType::AssistantMessage);
    draft.text = Some(truncate_capture(&remaining, MAX_TOOL_OUTPUT));
    let mut meta = serde_json::Map::new();
    if let Some(id) = message_id {
        meta.insert("message_id".into(), Value::String(id.clone()));
    }
    if let Some(m) = model {
        meta.insert("model".into(), Value::String(m.clone()));
    }
    // Token counters live on the message; attach them to the text event.
    if let Some(t) = tokens.take() {
        meta.insert("tokens".into(), t);
    }
    if !meta.is_empty() {
        draft.meta = Some(Value::Object(meta));
    }
    events.push(draft);
}

fn push_tool_call(
    seq: f64,
    ts: &str,
    name: &str,
    args: Value,
    call_id: Option<String>,
    events: &mut Vec<EventDraft>,
) {
    let mut draft = EventDraft::new(seq, ts.to_string(), EventType::ToolCall);
    draft.tool_name = Some(name.to_string());
    draft.file_paths = extract_file_paths(&args);
    // Keep the args searchable.
    draft.text = Some(truncate_capture(&args.to_string(), MAX_TOOL_OUTPUT));
    if let Some(id) = &call_id {
        draft.meta = Some(json!({"tool_call_id": id}));
    }

    // The write tool's content argument is preserved as its own result so
    // the as-written bytes survive alongside the call.
    let write_content = if is_write_tool(name) {
        args.get("content").and_then(|v| v.as_str()).map(String::from)
    } else {
        None
    };
    let file_paths = draft.file_paths.clone();
    draft.tool_args = Some(args);
    events.push(draft);

    if let Some(content) = write_content {
        let mut result = EventDraft::new(seq + 0.5, ts.to_string(), EventType::ToolResult);
        result.tool_name = Some(name.to_string());
        result.text = Some(truncate_capture(&content, MAX_FILE_CAPTURE));
        result.file_paths = file_paths;
        let mut meta = serde_json::Map::new();
        if let Some(id) = call_id {
            meta.insert("tool_call_id".into(), Value::String(id));
        }
        meta.insert("is_write_content".into(), Value::Bool(true));
        result.meta = Some(Value::Object(meta));
        events.push(result);
    }
}

static INVOCATIONS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<function_calls>(.*?)</function_calls>(?:\s*<result>(.*?)</result>)?",
    )
    .unwrap()
});
static INVOKE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<invoke name="([^"]+)">(.*?)</invoke>"#).unwrap());
static PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<parameter name="([^"]+)">(.*?)</parameter>"#).unwrap());

/// Convert legacy XML-embedded tool invocations into paired events, and
/// return the surrounding prose with the blocks removed.
fn parse_legacy_invocations(
    text: &str,
    ts: &str,
    next_seq: &mut i64,
    pairs: &mut HashMap<String, (f64, String)>,
    events: &mut Vec<EventDraft>,
) -> String {
    if !text.contains("<function_calls>") {
        return text.to_string();
    }

    let mut remaining = String::with_capacity(text.len());
    let mut last_end = 0usize;

    for caps in INVOCATIONS_RE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        remaining.push_str(&text[last_end..whole.start()]);
        last_end = whole.end();

        let body = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let result_text = caps.get(2).map(|m| m.as_str());

        let invokes: Vec<(String, Value)> = INVOKE_RE
            .captures_iter(body)
            .map(|inv| {
                let name = inv[1].to_string();
                let mut args = serde_json::Map::new();
                for param in PARAM_RE.captures_iter(&inv[2]) {
                    args.insert(param[1].to_string(), Value::String(param[2].to_string()));
                }
                (name, Value::Object(args))
            })
            .collect();

        let count = invokes.len();
        for (i, (name, args)) in invokes.into_iter().enumerate() {
            let seq = alloc(next_seq);
            let call_id = format!("legacy_{}", crate::adapter::format_seq(seq));
            pairs.insert(call_id.clone(), (seq, name.clone()));
            push_tool_call(seq, ts, &name, args, Some(call_id.clone()), events);

            // A trailing <result> block belongs to the final invocation.
            if i + 1 == count {
                if let Some(output) = result_text {
                    let mut result =
                        EventDraft::new(seq + 0.5, ts.to_string(), EventType::ToolResult);
                    result.tool_name = Some(name);
                    result.text = Some(truncate_capture(output.trim(), MAX_TOOL_OUTPUT));
                    result.meta = Some(json!({"tool_call_id": call_id}));
                    events.push(result);
                }
            }
        }
    }

    remaining.push_str(&text[last_end..]);
    remaining
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn extract_file_paths(args: &Value) -> Vec<String> {
    let mut paths = vec![];
    for key in ["file_path", "filePath", "path", "notebook_path"] {
        if let Some(p) = args.get(key).and_then(|v| v.as_str()) {
            if !paths.iter().any(|x| x == p) {
                paths.push(p.to_string());
            }
        }
    }
    paths
}

fn is_write_tool(name: &str) -> bool {
    matches!(name.to_ascii_lowercase().as_str(), "write" | "write_file" | "create_file")
}

fn alloc(next_seq: &mut i64) -> f64 {
    let seq = *next_seq;
    *next_seq += 1;
    seq as f64
}

#[cfg(unix)]
fn file_inode(metadata: &std::fs::Metadata) -> Option<i64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino() as i64)
}

#[cfg(not(unix))]
fn file_inode(_metadata: &std::fs::Metadata) -> Option<i64> {
    None
}

pub(super) fn file_mtime(metadata: &std::fs::Metadata) -> Option<i64> {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

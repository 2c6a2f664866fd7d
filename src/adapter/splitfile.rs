//! Split-file transcript adapter.
//!
//! Layout: `session/<project>/ses_*.json` for session metadata,
//! `message/<session>/msg_*.json` for message metadata, `part/<message>/prt_*.json`
//! for message content, plus a per-session `session_diff/<session>.json` of
//! applied file diffs. A session's message order is each message's creation
//! time; parts order by their start time.
//!
//! Tens of thousands of leaf files make per-file watching pathological, so
//! change detection is mtime-based: the session file and the diff file are
//! both compared against the cursor, and ingestion is skipped only when
//! neither moved.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use super::jsonl::file_mtime;
use super::{
    truncate_capture, Cursor, EventDraft, EventType, IngestOutput, IngestReport,
    NormalizeContext, SourceAdapter, SourceCandidate, SourceKind, MAX_FILE_CAPTURE,
    MAX_TOOL_OUTPUT,
};
use crate::error::IngestError;
use crate::timeutil;

pub struct SplitFileAdapter {
    base_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct SessionFile {
    directory: Option<String>,
    time: Option<TimeRange>,
}

#[derive(Debug, Deserialize)]
struct TimeRange {
    created: Option<i64>,
    #[allow(dead_code)]
    updated: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MessageFile {
    id: String,
    role: Option<String>,
    #[serde(rename = "providerID")]
    provider_id: Option<String>,
    #[serde(rename = "modelID")]
    model_id: Option<String>,
    time: Option<MessageTime>,
}

#[derive(Debug, Deserialize)]
struct MessageTime {
    created: Option<i64>,
    completed: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PartFile {
    #[serde(rename = "type")]
    part_type: String,
    text: Option<String>,
    tool: Option<String>,
    #[serde(rename = "callID")]
    call_id: Option<String>,
    state: Option<ToolState>,
    tokens: Option<TokenInfo>,
    time: Option<PartTime>,
}

#[derive(Debug, Deserialize)]
struct PartTime {
    start: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ToolState {
    status: Option<String>,
    input: Option<Value>,
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    input: Option<i64>,
    output: Option<i64>,
    cache: Option<CacheInfo>,
}

#[derive(Debug, Deserialize)]
struct CacheInfo {
    read: Option<i64>,
    write: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DiffEntry {
    file: String,
    before: Option<String>,
    after: Option<String>,
    additions: Option<i64>,
    deletions: Option<i64>,
}

impl SplitFileAdapter {
    pub fn new(custom_path: Option<PathBuf>) -> Self {
        let base_path = custom_path.unwrap_or_else(|| {
            let home = dirs::home_dir().unwrap_or_default();
            home.join(".local/share/opencode/storage")
        });
        Self { base_path }
    }

    fn session_dir(&self) -> PathBuf {
        self.base_path.join("session")
    }

    /// Resolve the storage root from a session-file locator.
    fn storage_root(locator: &Path) -> Option<PathBuf> {
        // <root>/session/<project>/ses_X.json
        locator.parent()?.parent()?.parent().map(Path::to_path_buf)
    }

    fn sorted_json_files(dir: &Path, prefix: &str) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return vec![];
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(prefix) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }
}

impl SourceAdapter for SplitFileAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::SplitTranscript
    }

    fn discover(&self) -> Result<Vec<SourceCandidate>> {
        let mut candidates = vec![];
        let session_dir = self.session_dir();
        if !session_dir.exists() {
            return Ok(candidates);
        }

        for project_entry in std::fs::read_dir(&session_dir)? {
            let project_dir = project_entry?.path();
            if !project_dir.is_dir() {
                continue;
            }
            for file in Self::sorted_json_files(&project_dir, "ses_") {
                let session_id = file
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("unknown")
                    .to_string();
                let project_dir = std::fs::read_to_string(&file)
                    .ok()
                    .and_then(|c| serde_json::from_str::<SessionFile>(&c).ok())
                    .and_then(|s| s.directory)
                    .map(PathBuf::from);
                candidates.push(SourceCandidate {
                    kind: SourceKind::SplitTranscript,
                    locator: file.to_string_lossy().to_string(),
                    session_id: Some(session_id),
                    project_dir,
                });
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
        let session_path = Path::new(locator);
        let metadata = std::fs::metadata(session_path)
            .map_err(|_| IngestError::missing(format!("session file vanished: {locator}")))?;

        let session_id = session_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        let root = Self::storage_root(session_path)
            .ok_or_else(|| IngestError::adapter(format!("unexpected session layout: {locator}")))?;
        let diff_path = root.join("session_diff").join(format!("{session_id}.json"));

        let session_mtime = file_mtime(&metadata);
        let diff_mtime = std::fs::metadata(&diff_path).ok().as_ref().and_then(file_mtime);

        // Skip only when neither the session nor its diff file moved.
        if let Some(c) = cursor {
            if c.file_mtime == session_mtime && c.diff_mtime == diff_mtime {
                return Ok(IngestOutput {
                    events: vec![],
                    new_cursor: c.clone(),
                    report: IngestReport::default(),
                });
            }
        }

        let session: SessionFile = serde_json::from_str(
            &std::fs::read_to_string(session_path)?,
        )
        .map_err(|e| IngestError::adapter(format!("unparseable session file: {e}")))?;

        let mut report = IngestReport::default();
        let mut events: Vec<EventDraft> = vec![];
        let mut first_completed_ms: Option<i64> = None;

        let message_dir = root.join("message").join(&session_id);
        let mut messages: Vec<(i64, MessageFile)> = vec![];
        for path in Self::sorted_json_files(&message_dir, "msg_") {
            let Ok(content) = std::fs::read_to_string(&path) else {
                report.lines_skipped += 1;
                continue;
            };
            match serde_json::from_str::<MessageFile>(&content) {
                Ok(msg) => {
                    let created = msg.time.as_ref().and_then(|t| t.created).unwrap_or(0);
                    messages.push((created, msg));
                }
                Err(_) => report.lines_skipped += 1,
            }
        }
        messages.sort_by_key(|(created, _)| *created);

        for (created_ms, msg) in &messages {
            let role = msg.role.clone().unwrap_or_else(|| {
                if msg.provider_id.is_some() {
                    "assistant".to_string()
                } else {
                    "user".to_string()
                }
            });

            // Assistant messages are only ingested once complete; an
            // in-flight message is re-evaluated on a later tick.
            let completed = msg.time.as_ref().and_then(|t| t.completed);
            if role == "assistant" && completed.is_none() {
                report.messages_deferred += 1;
                continue;
            }
            if first_completed_ms.is_none() {
                first_completed_ms = Some(*created_ms);
            }

            self.normalize_message(
                &root,
                msg,
                &role,
                *created_ms,
                &mut events,
                &mut report,
            );
        }

        // Diff entries flow through the edit stream as edit tool calls,
        // timestamped at the first completed message of the session.
        if diff_path.exists() {
            let anchor_ms = first_completed_ms
                .or_else(|| session.time.as_ref().and_then(|t| t.created))
                .unwrap_or(0);
            let anchor_ts = timeutil::ms_to_rfc3339(anchor_ms)
                .unwrap_or_else(|| timeutil::to_rfc3339_z(&chrono::Utc::now()));
            match serde_json::from_str::<Vec<DiffEntry>>(
                &std::fs::read_to_string(&diff_path)?,
            ) {
                Ok(entries) => {
                    for (d, entry) in entries.into_iter().enumerate() {
                        let seq = anchor_ms as f64 + 0.25 + d as f64;
                        let mut draft =
                            EventDraft::new(seq, anchor_ts.clone(), EventType::ToolCall);
                        draft.tool_name = Some("edit".to_string());
                        let args = json!({
                            "file_path": entry.file,
                            "oldString": entry.before.unwrap_or_default(),
                            "newString": entry.after.unwrap_or_default(),
                        });
                        draft.file_paths =
                            vec![args["file_path"].as_str().unwrap_or_default().to_string()];
                        draft.text = Some(truncate_capture(&args.to_string(), MAX_FILE_CAPTURE));
                        draft.tool_args = Some(args);
                        draft.meta = Some(json!({
                            "additions": entry.additions,
                            "deletions": entry.deletions,
                            "from_session_diff": true,
                        }));
                        events.push(draft);
                    }
                }
                Err(_) => report.lines_skipped += 1,
            }
        }

        report.events_emitted = events.len();
        let new_cursor = Cursor {
            source_id: ctx.source_id.clone(),
            file_inode: None,
            file_size: Some(metadata.len() as i64),
            file_mtime: session_mtime,
            byte_offset: None,
            diff_mtime,
            last_event_id: None,
            last_rowid: None,
            updated_at: None,
        };

        Ok(IngestOutput {
            events,
            new_cursor,
            report,
        })
    }
}

impl SplitFileAdapter {
    fn normalize_message(
        &self,
        root: &Path,
        msg: &MessageFile,
        role: &str,
        created_ms: i64,
        events: &mut Vec<EventDraft>,
        report: &mut IngestReport,
    ) {
        let part_dir = root.join("part").join(&msg.id);
        let mut parts: Vec<(i64, PartFile)> = vec![];
        for (i, path) in Self::sorted_json_files(&part_dir, "prt_").iter().enumerate() {
            let Ok(content) = std::fs::read_to_string(path) else {
                report.lines_skipped += 1;
                continue;
            };
            match serde_json::from_str::<PartFile>(&content) {
                Ok(part) => {
                    let start = part
                        .time
                        .as_ref()
                        .and_then(|t| t.start)
                        .unwrap_or(created_ms + i as i64);
                    parts.push((start, part));
                }
                Err(_) => report.lines_skipped += 1,
            }
        }
        parts.sort_by_key(|(start, _)| *start);

        // Token counters live on the message, not its parts; they attach to
        // the first emitted event only so aggregation never double-counts.
        let mut tokens: Option<Value> = parts.iter().find_map(|(_, p)| {
            p.tokens.as_ref().map(|t| {
                json!({
                    "input": t.input,
                    "output": t.output,
                    "cache_read": t.cache.as_ref().and_then(|c| c.read),
                    "cache_write": t.cache.as_ref().and_then(|c| c.write),
                })
            })
        });

        let base_ts = timeutil::ms_to_rfc3339(created_ms)
            .unwrap_or_else(|| timeutil::to_rfc3339_z(&chrono::Utc::now()));

        for (p, (start_ms, part)) in parts.iter().enumerate() {
            let ts = timeutil::ms_to_rfc3339(*start_ms).unwrap_or_else(|| base_ts.clone());
            let seq = created_ms as f64 + p as f64;
            match part.part_type.as_str() {
                "text" => {
                    let Some(text) = part.text.as_deref() else { continue };
                    if text.trim().is_empty() {
                        continue;
                    }
                    let event_type = if role == "assistant" {
                        EventType::AssistantMessage
                    } else {
                        EventType::UserMessage
                    };
                    let mut draft = EventDraft::new(seq, ts, event_type);
                    draft.text = Some(truncate_capture(text, MAX_TOOL_OUTPUT));
                    let mut meta = serde_json::Map::new();
                    meta.insert("message_id".into(), Value::String(msg.id.clone()));
                    if let Some(model) = &msg.model_id {
                        meta.insert("model".into(), Value::String(model.clone()));
                    }
                    if let Some(t) = tokens.take() {
                        meta.insert("tokens".into(), t);
                    }
                    draft.meta = Some(Value::Object(meta));
                    events.push(draft);
                }
                "tool" => {
                    let name = part.tool.clone().unwrap_or_else(|| "unknown".to_string());
                    let args = part
                        .state
                        .as_ref()
                        .and_then(|s| s.input.clone())
                        .unwrap_or(Value::Null);
                    let mut draft = EventDraft::new(seq, ts.clone(), EventType::ToolCall);
                    draft.tool_name = Some(name.clone());
                    draft.file_paths = extract_paths(&args);
                    draft.text = Some(truncate_capture(&args.to_string(), MAX_TOOL_OUTPUT));
                    let mut meta = serde_json::Map::new();
                    meta.insert("message_id".into(), Value::String(msg.id.clone()));
                    if let Some(id) = &part.call_id {
                        meta.insert("tool_call_id".into(), Value::String(id.clone()));
                    }
                    if let Some(t) = tokens.take() {
                        meta.insert("tokens".into(), t);
                        if let Some(model) = &msg.model_id {
                            meta.insert("model".into(), Value::String(model.clone()));
                        }
                    }
                    let file_paths = draft.file_paths.clone();
                    draft.tool_args = Some(args);
                    draft.meta = Some(Value::Object(meta));
                    events.push(draft);

                    let completed = part
                        .state
                        .as_ref()
                        .map(|s| s.status.as_deref() == Some("completed"))
                        .unwrap_or(false);
                    if completed {
                        if let Some(output) = part.state.as_ref().and_then(|s| s.output.as_deref())
                        {
                            let cap = if super::is_file_tool(&name) {
                                MAX_FILE_CAPTURE
                            } else {
                                MAX_TOOL_OUTPUT
                            };
                            let mut result =
                                EventDraft::new(seq + 0.5, ts, EventType::ToolResult);
                            result.tool_name = Some(name);
                            result.text = Some(truncate_capture(output, cap));
                            result.file_paths = file_paths;
                            let mut meta = serde_json::Map::new();
                            meta.insert("message_id".into(), Value::String(msg.id.clone()));
                            if let Some(id) = &part.call_id {
                                meta.insert("tool_call_id".into(), Value::String(id.clone()));
                            }
                            result.meta = Some(Value::Object(meta));
                            events.push(result);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn extract_paths(args: &Value) -> Vec<String> {
    let mut paths = vec![];
    for key in ["file_path", "filePath", "path"] {
        if let Some(p) = args.get(key).and_then(|v| v.as_str()) {
            if !paths.iter().any(|x| x == p) {
                paths.push(p.to_string());
            }
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> NormalizeContext {
        NormalizeContext {
            source_id: "src_split".into(),
            device_id: "dev_test".into(),
            project_id: None,
            session_id: Some("ses_a".into()),
            source_kind: SourceKind::SplitTranscript,
            redact_secrets: true,
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        locator: String,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let session_dir = root.join("session/proj1");
        std::fs::create_dir_all(&session_dir).unwrap();
        let session_path = session_dir.join("ses_a.json");
        std::fs::write(
            &session_path,
            serde_json::json!({
                "id": "ses_a",
                "directory": "/home/me/proj1",
                "time": {"created": 1740000000000i64, "updated": 1740000600000i64},
            })
            .to_string(),
        )
        .unwrap();
        Fixture {
            locator: session_path.to_string_lossy().to_string(),
            root,
            _dir: dir,
        }
    }

    fn write_message(
        root: &Path,
        msg_id: &str,
        role: &str,
        created: i64,
        completed: Option<i64>,
    ) {
        let dir = root.join("message/ses_a");
        std::fs::create_dir_all(&dir).unwrap();
        let mut time = serde_json::json!({"created": created});
        if let Some(c) = completed {
            time["completed"] = serde_json::json!(c);
        }
        let mut msg = serde_json::json!({
            "id": msg_id,
            "sessionID": "ses_a",
            "role": role,
            "time": time,
        });
        if role == "assistant" {
            msg["providerID"] = serde_json::json!("anthropic");
            msg["modelID"] = serde_json::json!("claude-opus-4-6");
        }
        std::fs::write(dir.join(format!("{msg_id}.json")), msg.to_string()).unwrap();
    }

    fn write_part(root: &Path, msg_id: &str, part_id: &str, body: Value) {
        let dir = root.join("part").join(msg_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{part_id}.json")), body.to_string()).unwrap();
    }

    #[test]
    fn completed_messages_emit_ordered_events() {
        let f = fixture();
        write_message(&f.root, "msg_01", "user", 1740000001000, None);
        write_part(
            &f.root,
            "msg_01",
            "prt_01",
            serde_json::json!({"type": "text", "text": "please fix the bug",
                              "time": {"start": 1740000001000i64}}),
        );
        write_message(&f.root, "msg_02", "assistant", 1740000002000, Some(1740000005000));
        write_part(
            &f.root,
            "msg_02",
            "prt_01",
            serde_json::json!({"type": "text", "text": "On it.",
                              "time": {"start": 1740000002000i64},
                              "tokens": {"input": 50, "output": 10, "cache": {"read": 5}}}),
        );

        let out = SplitFileAdapter::new(None)
            .ingest(&f.locator, None, &ctx())
            .unwrap();
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.events[0].event_type, EventType::UserMessage);
        assert_eq!(out.events[1].event_type, EventType::AssistantMessage);
        assert!(out.events[0].source_seq < out.events[1].source_seq);

        let meta = out.events[1].meta.as_ref().unwrap();
        assert_eq!(meta["model"], "claude-opus-4-6");
        assert_eq!(meta["tokens"]["input"], 50);
        assert_eq!(meta["tokens"]["cache_read"], 5);
    }

    #[test]
    fn incomplete_assistant_messages_are_deferred() {
        let f = fixture();
        write_message(&f.root, "msg_01", "assistant", 1740000001000, None);
        write_part(
            &f.root,
            "msg_01",
            "prt_01",
            serde_json::json!({"type": "text", "text": "streaming..."}),
        );

        let out = SplitFileAdapter::new(None)
            .ingest(&f.locator, None, &ctx())
            .unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.report.messages_deferred, 1);
    }

    #[test]
    fn skips_when_neither_mtime_changed() {
        let f = fixture();
        write_message(&f.root, "msg_01", "user", 1740000001000, None);
        write_part(
            &f.root,
            "msg_01",
            "prt_01",
            serde_json::json!({"type": "text", "text": "hello"}),
        );

        let adapter = SplitFileAdapter::new(None);
        let out1 = adapter.ingest(&f.locator, None, &ctx()).unwrap();
        assert_eq!(out1.events.len(), 1);

        let out2 = adapter
            .ingest(&f.locator, Some(&out1.new_cursor), &ctx())
            .unwrap();
        assert!(out2.events.is_empty());
    }

    #[test]
    fn tool_parts_pair_call_and_result() {
        let f = fixture();
        write_message(&f.root, "msg_01", "assistant", 1740000001000, Some(1740000009000));
        write_part(
            &f.root,
            "msg_01",
            "prt_01",
            serde_json::json!({
                "type": "tool", "tool": "read", "callID": "call_7",
                "state": {"status": "completed",
                          "input": {"filePath": "src/lib.rs"},
                          "output": "pub fn lib() {}"},
                "time": {"start": 1740000001500i64},
            }),
        );

        let out = SplitFileAdapter::new(None)
            .ingest(&f.locator, None, &ctx())
            .unwrap();
        assert_eq!(out.events.len(), 2);
        let call = &out.events[0];
        let result = &out.events[1];
        assert_eq!(call.event_type, EventType::ToolCall);
        assert_eq!(call.tool_name.as_deref(), Some("read"));
        assert_eq!(call.file_paths, vec!["src/lib.rs".to_string()]);
        assert_eq!(result.event_type, EventType::ToolResult);
        assert_eq!(result.source_seq, call.source_seq + 0.5);
        assert_eq!(result.text.as_deref(), Some("pub fn lib() {}"));
        assert_eq!(
            result.meta.as_ref().unwrap()["tool_call_id"],
            call.meta.as_ref().unwrap()["tool_call_id"]
        );
    }

    #[test]
    fn session_diffs_become_edit_calls() {
        let f = fixture();
        write_message(&f.root, "msg_01", "assistant", 1740000001000, Some(1740000002000));
        write_part(
            &f.root,
            "msg_01",
            "prt_01",
            serde_json::json!({"type": "text", "text": "done"}),
        );
        let diff_dir = f.root.join("session_diff");
        std::fs::create_dir_all(&diff_dir).unwrap();
        std::fs::write(
            diff_dir.join("ses_a.json"),
            serde_json::json!([
                {"file": "src/a.rs", "before": "old body", "after": "new body",
                 "additions": 1, "deletions": 1},
            ])
            .to_string(),
        )
        .unwrap();

        let out = SplitFileAdapter::new(None)
            .ingest(&f.locator, None, &ctx())
            .unwrap();
        let edit = out
            .events
            .iter()
            .find(|e| e.tool_name.as_deref() == Some("edit"))
            .unwrap();
        let args = edit.tool_args.as_ref().unwrap();
        assert_eq!(args["file_path"], "src/a.rs");
        assert_eq!(args["oldString"], "old body");
        assert_eq!(args["newString"], "new body");
        // Anchored at the first completed message.
        assert_eq!(edit.event_ts, timeutil::ms_to_rfc3339(1740000001000).unwrap());
    }

    #[test]
    fn diff_change_alone_triggers_reingest() {
        let f = fixture();
        write_message(&f.root, "msg_01", "user", 1740000001000, None);
        write_part(
            &f.root,
            "msg_01",
            "prt_01",
            serde_json::json!({"type": "text", "text": "hello"}),
        );
        let adapter = SplitFileAdapter::new(None);
        let out1 = adapter.ingest(&f.locator, None, &ctx()).unwrap();

        let diff_dir = f.root.join("session_diff");
        std::fs::create_dir_all(&diff_dir).unwrap();
        std::fs::write(
            diff_dir.join("ses_a.json"),
            serde_json::json!([{"file": "x.rs", "before": "a", "after": "b"}]).to_string(),
        )
        .unwrap();

        let out2 = adapter
            .ingest(&f.locator, Some(&out1.new_cursor), &ctx())
            .unwrap();
        assert!(out2
            .events
            .iter()
            .any(|e| e.tool_name.as_deref() == Some("edit")));
    }

    #[test]
    fn reingest_is_deterministic() {
        let f = fixture();
        write_message(&f.root, "msg_01", "user", 1740000001000, None);
        write_part(
            &f.root,
            "msg_01",
            "prt_01",
            serde_json::json!({"type": "text", "text": "same bytes"}),
        );
        let adapter = SplitFileAdapter::new(None);
        let a = adapter.ingest(&f.locator, None, &ctx()).unwrap();
        let b = adapter.ingest(&f.locator, None, &ctx()).unwrap();
        assert_eq!(a.events.len(), b.events.len());
        assert_eq!(a.events[0].source_seq, b.events[0].source_seq);
        assert_eq!(a.events[0].payload_hash(), b.events[0].payload_hash());
    }
}

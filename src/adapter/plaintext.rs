//! Plain-text transcript adapter.
//!
//! Layout: per-working-dir subdirectories under the base path, each holding
//! `.txt` files of one agent session apiece. A session file is tokenized by
//! literal section headers:
//!
//! ```text
//! Directory: /home/me/proj        (optional preamble)
//! ## User
//! ...
//! ## Assistant
//! ...
//! ## Thinking
//! ...
//! ## Tool Call: bash
//! ...
//! ## Tool Result
//! ...
//! ```
//!
//! The whole file's mtime is the cursor granularity; any change re-ingests
//! the file and the store's event-id dedup absorbs the overlap.

use anyhow::Result;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use super::jsonl::file_mtime;
use super::{
    truncate_capture, Cursor, EventDraft, EventType, IngestOutput, IngestReport,
    NormalizeContext, SourceAdapter, SourceCandidate, SourceKind, MAX_TOOL_OUTPUT,
};
use crate::error::IngestError;
use crate::timeutil;

pub struct PlainTextAdapter {
    base_path: PathBuf,
}

#[derive(Debug, PartialEq)]
enum Block {
    User,
    Assistant,
    Thinking,
    ToolCall(String),
    ToolResult,
}

impl PlainTextAdapter {
    pub fn new(custom_path: Option<PathBuf>) -> Self {
        let base_path = custom_path.unwrap_or_else(|| {
            let home = dirs::home_dir().unwrap_or_default();
            home.join(".local/share/agent-transcripts")
        });
        Self { base_path }
    }

    fn parse_header(line: &str) -> Option<Block> {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("## Tool Call:") {
            return Some(Block::ToolCall(rest.trim().to_string()));
        }
        match line {
            "## User" => Some(Block::User),
            "## Assistant" => Some(Block::Assistant),
            "## Thinking" => Some(Block::Thinking),
            "## Tool Result" => Some(Block::ToolResult),
            _ => None,
        }
    }
}

impl SourceAdapter for PlainTextAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::PlainTranscript
    }

    fn discover(&self) -> Result<Vec<SourceCandidate>> {
        let mut candidates = vec![];
        if !self.base_path.exists() {
            return Ok(candidates);
        }

        for dir_entry in std::fs::read_dir(&self.base_path)? {
            let workdir = dir_entry?.path();
            if !workdir.is_dir() {
                continue;
            }
            for file_entry in std::fs::read_dir(&workdir)? {
                let file_path = file_entry?.path();
                if file_path.extension().map(|e| e == "txt").unwrap_or(false) {
                    let session_id = file_path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or("unknown")
                        .to_string();
                    candidates.push(SourceCandidate {
                        kind: SourceKind::PlainTranscript,
                        locator: file_path.to_string_lossy().to_string(),
                        session_id: Some(session_id),
                        project_dir: peek_directory(&file_path),
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
        let mtime = file_mtime(&metadata);

        if let Some(c) = cursor {
            if c.file_mtime == mtime && c.file_size == Some(metadata.len() as i64) {
                return Ok(IngestOutput {
                    events: vec![],
                    new_cursor: c.clone(),
                    report: IngestReport::default(),
                });
            }
        }

        let content = std::fs::read_to_string(path)?;
        let ts = mtime
            .and_then(|m| timeutil::ms_to_rfc3339(m * 1000))
            .unwrap_or_else(|| timeutil::to_rfc3339_z(&chrono::Utc::now()));

        let mut events = vec![];
        let mut report = IngestReport::default();
        let mut current: Option<(Block, Vec<&str>)> = None;
        let mut seq: i64 = 0;
        let mut last_call: Option<(f64, String, String)> = None;

        let mut flush = |block: Option<(Block, Vec<&str>)>,
                         seq: &mut i64,
                         last_call: &mut Option<(f64, String, String)>,
                         events: &mut Vec<EventDraft>| {
            let Some((block, lines)) = block else { return };
            let body = lines.join("\n").trim().to_string();
            if body.is_empty() && !matches!(block, Block::ToolCall(_)) {
                return;
            }
            *seq += 1;
            let block_seq = *seq as f64;
            match block {
                Block::User => {
                    let mut draft = EventDraft::new(block_seq, ts.clone(), EventType::UserMessage);
                    draft.text = Some(truncate_capture(&body, MAX_TOOL_OUTPUT));
                    events.push(draft);
                    *last_call = None;
                }
                Block::Assistant => {
                    let mut draft =
                        EventDraft::new(block_seq, ts.clone(), EventType::AssistantMessage);
                    draft.text = Some(truncate_capture(&body, MAX_TOOL_OUTPUT));
                    events.push(draft);
                    *last_call = None;
                }
                Block::Thinking => {
                    // Thinking blocks stay out of the store.
                    *seq -= 1;
                }
                Block::ToolCall(name) => {
                    let call_id = format!("txt_{}", *seq);
                    let mut draft = EventDraft::new(block_seq, ts.clone(), EventType::ToolCall);
                    draft.tool_name = Some(name.clone());
                    let args = match serde_json::from_str::<Value>(&body) {
                        Ok(v @ Value::Object(_)) => v,
                        _ => json!({"input": body}),
                    };
                    draft.file_paths = args
                        .get("file_path")
                        .and_then(|v| v.as_str())
                        .map(|p| vec![p.to_string()])
                        .unwrap_or_default();
                    draft.text = Some(truncate_capture(&args.to_string(), MAX_TOOL_OUTPUT));
                    draft.tool_args = Some(args);
                    draft.meta = Some(json!({"tool_call_id": call_id}));
                    events.push(draft);
                    *last_call = Some((block_seq, name, call_id));
                }
                Block::ToolResult => {
                    // Pairs with the immediately preceding call when present.
                    let (result_seq, tool_name, call_id) = match last_call.take() {
                        Some((call_seq, name, id)) => {
                            *seq -= 1;
                            (call_seq + 0.5, Some(name), Some(id))
                        }
                        None => (block_seq, None, None),
                    };
                    let mut draft = EventDraft::new(result_seq, ts.clone(), EventType::ToolResult);
                    draft.tool_name = tool_name;
                    draft.text = Some(truncate_capture(&body, MAX_TOOL_OUTPUT));
                    if let Some(id) = call_id {
                        draft.meta = Some(json!({"tool_call_id": id}));
                    }
                    events.push(draft);
                }
            }
        };

        for line in content.lines() {
            match Self::parse_header(line) {
                Some(block) => {
                    flush(current.take(), &mut seq, &mut last_call, &mut events);
                    current = Some((block, vec![]));
                }
                None => match current.as_mut() {
                    Some((_, lines)) => lines.push(line),
                    None => {
                        // Preamble lines before the first header.
                        if !line.trim().is_empty()
                            && !line.trim_start().starts_with("Directory:")
                            && !line.trim_start().starts_with('#')
                        {
                            report.lines_skipped += 1;
                        }
                    }
                },
            }
        }
        flush(current.take(), &mut seq, &mut last_call, &mut events);

        report.events_emitted = events.len();
        let new_cursor = Cursor {
            source_id: ctx.source_id.clone(),
            file_inode: None,
            file_size: Some(metadata.len() as i64),
            file_mtime: mtime,
            byte_offset: None,
            diff_mtime: None,
            last_event_id: None,
            last_rowid: Some(seq),
            updated_at: None,
        };

        Ok(IngestOutput {
            events,
            new_cursor,
            report,
        })
    }
}

fn peek_directory(path: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines().take(5) {
        if let Some(dir) = line.trim().strip_prefix("Directory:") {
            return Some(PathBuf::from(dir.trim()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> NormalizeContext {
        NormalizeContext {
            source_id: "src_txt".into(),
            device_id: "dev_test".into(),
            project_id: None,
            session_id: Some("session-1".into()),
            source_kind: SourceKind::PlainTranscript,
            redact_secrets: true,
        }
    }

    const TRANSCRIPT: &str = "Directory: /home/me/proj\n\
## User\n\
fix the off-by-one\n\
## Thinking\n\
let me look at the loop bounds\n\
## Tool Call: bash\n\
{\"input\": \"grep -n range src/main.rs\"}\n\
## Tool Result\n\
12: for i in 0..len\n\
## Assistant\n\
The loop excludes the last element; change 0..len to 0..=len.\n";

    #[test]
    fn tokenizes_blocks_into_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session-1.txt");
        std::fs::write(&path, TRANSCRIPT).unwrap();

        let out = PlainTextAdapter::new(None)
            .ingest(&path.to_string_lossy(), None, &ctx())
            .unwrap();
        let types: Vec<&str> = out.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["user_message", "tool_call", "tool_result", "assistant_message"]
        );

        let call = &out.events[1];
        let result = &out.events[2];
        assert_eq!(call.tool_name.as_deref(), Some("bash"));
        assert_eq!(result.source_seq, call.source_seq + 0.5);
        assert_eq!(
            result.meta.as_ref().unwrap()["tool_call_id"],
            call.meta.as_ref().unwrap()["tool_call_id"]
        );
        assert!(result.text.as_ref().unwrap().contains("for i in 0..len"));
    }

    #[test]
    fn thinking_blocks_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session-1.txt");
        std::fs::write(&path, TRANSCRIPT).unwrap();

        let out = PlainTextAdapter::new(None)
            .ingest(&path.to_string_lossy(), None, &ctx())
            .unwrap();
        assert!(out
            .events
            .iter()
            .all(|e| !e.text.as_deref().unwrap_or("").contains("loop bounds")));
    }

    #[test]
    fn unchanged_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session-1.txt");
        std::fs::write(&path, TRANSCRIPT).unwrap();
        let adapter = PlainTextAdapter::new(None);
        let locator = path.to_string_lossy().to_string();

        let out1 = adapter.ingest(&locator, None, &ctx()).unwrap();
        assert!(!out1.events.is_empty());
        let out2 = adapter
            .ingest(&locator, Some(&out1.new_cursor), &ctx())
            .unwrap();
        assert!(out2.events.is_empty());
    }

    #[test]
    fn reingest_yields_identical_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session-1.txt");
        std::fs::write(&path, TRANSCRIPT).unwrap();
        let adapter = PlainTextAdapter::new(None);
        let locator = path.to_string_lossy().to_string();

        let a = adapter.ingest(&locator, None, &ctx()).unwrap();
        let b = adapter.ingest(&locator, None, &ctx()).unwrap();
        let ids = |out: &IngestOutput| {
            out.events
                .iter()
                .map(|e| (e.source_seq.to_bits(), e.payload_hash()))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn discover_finds_sessions_and_directory_hint() {
        let dir = TempDir::new().unwrap();
        let workdir = dir.path().join("proj-slug");
        std::fs::create_dir_all(&workdir).unwrap();
        std::fs::write(workdir.join("session-1.txt"), TRANSCRIPT).unwrap();

        let adapter = PlainTextAdapter::new(Some(dir.path().to_path_buf()));
        let candidates = adapter.discover().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].session_id.as_deref(), Some("session-1"));
        assert_eq!(
            candidates[0].project_dir.as_deref(),
            Some(Path::new("/home/me/proj"))
        );
    }
}

//! Source adapter trait and the canonical event model.
//!
//! Each adapter knows one harness's on-disk layout: it discovers sources on
//! this machine, tails or re-scans them from a durable cursor, and
//! normalizes what it reads into canonical event drafts. The orchestrator
//! applies redaction and turns drafts into stored rows.

mod gitrepo;
mod jsonl;
mod plaintext;
mod splitfile;

pub use gitrepo::GitRepoAdapter;
pub use jsonl::JsonlAdapter;
pub use plaintext::PlainTextAdapter;
pub use splitfile::SplitFileAdapter;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::config::Config;
use crate::error::IngestError;

/// Captured file contents (reads/writes) are capped at ~100 KB.
pub const MAX_FILE_CAPTURE: usize = 100_000;
/// Other tool output is capped at ~50 KB.
pub const MAX_TOOL_OUTPUT: usize = 50_000;

/// Source kind discriminator, stored on sources and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    JsonlTranscript,
    SplitTranscript,
    PlainTranscript,
    Git,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::JsonlTranscript => "jsonl_transcript",
            SourceKind::SplitTranscript => "split_transcript",
            SourceKind::PlainTranscript => "plain_transcript",
            SourceKind::Git => "git",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "jsonl_transcript" => Some(SourceKind::JsonlTranscript),
            "split_transcript" => Some(SourceKind::SplitTranscript),
            "plain_transcript" => Some(SourceKind::PlainTranscript),
            "git" => Some(SourceKind::Git),
            _ => None,
        }
    }
}

/// Canonical event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    UserMessage,
    AssistantMessage,
    ToolCall,
    ToolResult,
    GitCommit,
    GitBranch,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserMessage => "user_message",
            EventType::AssistantMessage => "assistant_message",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::GitCommit => "git_commit",
            EventType::GitBranch => "git_branch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_message" => Some(EventType::UserMessage),
            "assistant_message" => Some(EventType::AssistantMessage),
            "tool_call" => Some(EventType::ToolCall),
            "tool_result" => Some(EventType::ToolResult),
            "git_commit" => Some(EventType::GitCommit),
            "git_branch" => Some(EventType::GitBranch),
            _ => None,
        }
    }

    /// Events captured from the user side are redacted; assistant text is
    /// model output and passes through unchanged.
    pub fn is_redactable(&self) -> bool {
        !matches!(self, EventType::AssistantMessage)
    }
}

/// A source location an adapter found on this machine.
#[derive(Debug, Clone)]
pub struct SourceCandidate {
    pub kind: SourceKind,
    pub locator: String,
    pub session_id: Option<String>,
    /// Working directory hint used for project detection.
    pub project_dir: Option<PathBuf>,
}

/// Durable per-source ingestion progress.
///
/// Field usage varies by adapter: tailing sources track inode/offset/size,
/// split-file sources track the session and diff mtimes, git tracks the last
/// ingest time in `file_mtime`, and `last_rowid` is the integer sequence
/// high-water mark for adapters that allocate sequences.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cursor {
    pub source_id: String,
    pub file_inode: Option<i64>,
    pub file_size: Option<i64>,
    pub file_mtime: Option<i64>,
    pub byte_offset: Option<i64>,
    pub diff_mtime: Option<i64>,
    pub last_event_id: Option<String>,
    pub last_rowid: Option<i64>,
    pub updated_at: Option<String>,
}

/// Normalization context shared by all adapters for one ingest tick.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub source_id: String,
    pub device_id: String,
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub source_kind: SourceKind,
    pub redact_secrets: bool,
}

/// A normalized event before redaction and id assignment.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub source_seq: f64,
    pub event_ts: String,
    pub event_type: EventType,
    pub text: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<Value>,
    pub file_paths: Vec<String>,
    pub meta: Option<Value>,
    /// Overrides the context session when a locator spans sessions.
    pub session_id: Option<String>,
}

impl EventDraft {
    pub fn new(source_seq: f64, event_ts: String, event_type: EventType) -> Self {
        Self {
            source_seq,
            event_ts,
            event_type,
            text: None,
            tool_name: None,
            tool_args: None,
            file_paths: Vec::new(),
            meta: None,
            session_id: None,
        }
    }

    /// Stable hash of the normalized payload, fed into the event id.
    pub fn payload_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.event_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.event_ts.as_bytes());
        hasher.update([0u8]);
        if let Some(text) = &self.text {
            hasher.update(text.as_bytes());
        }
        hasher.update([0u8]);
        if let Some(name) = &self.tool_name {
            hasher.update(name.as_bytes());
        }
        hasher.update([0u8]);
        if let Some(args) = &self.tool_args {
            hasher.update(args.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// `event_id = sha256(source_id + ":" + source_seq + ":" + payload_hash)[:32]`
pub fn make_event_id(source_id: &str, source_seq: f64, payload_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", source_id, format_seq(source_seq), payload_hash));
    hex::encode(hasher.finalize())[..32].to_string()
}

/// Render a sequence number without trailing noise ("3", "3.5").
pub fn format_seq(seq: f64) -> String {
    if seq.fract() == 0.0 {
        format!("{}", seq as i64)
    } else {
        format!("{}", seq)
    }
}

/// Tools whose output is a file's contents, capped at the larger limit.
pub(crate) fn is_file_tool(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "read" | "read_file" | "view" | "cat" | "write" | "write_file" | "create_file" | "edit"
    )
}

/// Truncate captured text at a byte cap, on a char boundary.
pub fn truncate_capture(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Non-fatal counters from one ingest tick.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub events_emitted: usize,
    pub lines_skipped: usize,
    pub messages_deferred: usize,
}

/// Result of one adapter ingest call.
#[derive(Debug)]
pub struct IngestOutput {
    pub events: Vec<EventDraft>,
    pub new_cursor: Cursor,
    pub report: IngestReport,
}

/// One harness's discovery + tailing + normalization.
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Locators present on this machine.
    fn discover(&self) -> Result<Vec<SourceCandidate>>;

    /// Working directories referenced by this adapter's sessions, used to
    /// auto-register git sources.
    fn working_dirs(&self) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn ingest(
        &self,
        locator: &str,
        cursor: Option<&Cursor>,
        ctx: &NormalizeContext,
    ) -> Result<IngestOutput, IngestError>;
}

/// Registry of adapters enabled by configuration.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new(config: &Config) -> Self {
        let mut registry = Self { adapters: vec![] };

        if config.is_adapter_enabled("jsonl") {
            registry.register(Box::new(JsonlAdapter::new(config.adapter_path("jsonl"))));
        }
        if config.is_adapter_enabled("splitfile") {
            registry.register(Box::new(SplitFileAdapter::new(
                config.adapter_path("splitfile"),
            )));
        }
        if config.is_adapter_enabled("plaintext") {
            registry.register(Box::new(PlainTextAdapter::new(
                config.adapter_path("plaintext"),
            )));
        }
        if config.is_adapter_enabled("git") {
            registry.register(Box::new(GitRepoAdapter::new(config.git_author().clone())));
        }

        registry
    }

    pub fn register(&mut self, adapter: Box<dyn SourceAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn all(&self) -> impl Iterator<Item = &dyn SourceAdapter> {
        self.adapters.iter().map(|a| a.as_ref())
    }

    pub fn get(&self, kind: SourceKind) -> Option<&dyn SourceAdapter> {
        self.adapters
            .iter()
            .find(|a| a.kind() == kind)
            .map(|a| a.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_is_stable_and_short() {
        let id1 = make_event_id("src_a", 3.0, "deadbeef");
        let id2 = make_event_id("src_a", 3.0, "deadbeef");
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 32);
    }

    #[test]
    fn event_id_distinguishes_fractional_seq() {
        let call = make_event_id("src_a", 3.0, "deadbeef");
        let result = make_event_id("src_a", 3.5, "deadbeef");
        assert_ne!(call, result);
    }

    #[test]
    fn seq_formatting() {
        assert_eq!(format_seq(3.0), "3");
        assert_eq!(format_seq(3.5), "3.5");
    }

    #[test]
    fn payload_hash_reflects_content() {
        let mut a = EventDraft::new(1.0, "2025-01-01T00:00:00.000Z".into(), EventType::UserMessage);
        a.text = Some("hello".into());
        let mut b = a.clone();
        assert_eq!(a.payload_hash(), b.payload_hash());
        b.text = Some("world".into());
        assert_ne!(a.payload_hash(), b.payload_hash());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo".repeat(100);
        let t = truncate_capture(&s, 7);
        assert!(t.len() <= 7);
        assert!(s.starts_with(&t));
    }
}

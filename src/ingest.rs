//! Ingestion orchestrator.
//!
//! Drives adapters over registered sources: discovery and auto-registration,
//! cursor-resumed ingest ticks, redaction policy, and the atomic
//! (event batch, cursor) commit. Per-source failures land in the source's
//! status without aborting the batch.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;

use crate::adapter::{AdapterRegistry, EventDraft, IngestReport, NormalizeContext, SourceKind};
use crate::identity::{self, Device};
use crate::redact;
use crate::store::{SourceRegistration, SourceRow, Store, StoredEvent};
use crate::timeutil;

/// Per-source context carried from discovery to ingestion.
#[derive(Debug, Clone, Default)]
struct SourceMeta {
    project_id: Option<String>,
    session_id: Option<String>,
}

/// Outcome of one source's ingest tick.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: String,
    pub locator: String,
    pub inserted: usize,
    pub report: IngestReport,
    pub status: String,
}

#[derive(Debug, Default)]
pub struct IngestSummary {
    pub outcomes: Vec<SourceOutcome>,
    pub new_sources: usize,
}

pub struct Orchestrator {
    store: Store,
    registry: AdapterRegistry,
    device: Device,
    redact_default: bool,
    source_meta: HashMap<String, SourceMeta>,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        registry: AdapterRegistry,
        device: Device,
        redact_default: bool,
    ) -> Result<Self> {
        store.upsert_device(&device)?;
        Ok(Self {
            store,
            registry,
            device,
            redact_default,
            source_meta: HashMap::new(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run every adapter's discovery, registering unseen sources and
    /// git repositories referenced by transcript working directories.
    pub fn auto_register(&mut self) -> Result<usize> {
        let mut new_sources = 0usize;

        let mut candidates = vec![];
        for adapter in self.registry.all() {
            match adapter.discover() {
                Ok(found) => candidates.extend(found),
                Err(e) => {
                    tracing::warn!(kind = adapter.kind().as_str(), error = %e, "discovery failed");
                }
            }
        }

        for candidate in candidates {
            let known = self
                .store
                .get_source(&Store::source_id_for(&self.device.device_id, &candidate.locator))?
                .is_some();
            let source = self.store.register_source(&SourceRegistration {
                kind: candidate.kind.as_str().to_string(),
                locator: candidate.locator.clone(),
                device_id: self.device.device_id.clone(),
                redact_secrets: self.redact_default,
            })?;
            if !known {
                new_sources += 1;
                tracing::info!(locator = %candidate.locator, kind = candidate.kind.as_str(), "registered source");
            }

            let project_id = match &candidate.project_dir {
                Some(dir) => self.ensure_project(dir)?,
                None => None,
            };
            self.source_meta.insert(
                source.source_id.clone(),
                SourceMeta {
                    project_id,
                    session_id: candidate.session_id.clone(),
                },
            );
        }

        // Repositories behind the transcripts' working directories become
        // git sources of their own.
        let mut work_dirs = vec![];
        for adapter in self.registry.all() {
            if let Ok(dirs) = adapter.working_dirs() {
                work_dirs.extend(dirs);
            }
        }
        for dir in work_dirs {
            let Some(root) = identity::find_repo_root(&dir) else {
                continue;
            };
            let locator = root.to_string_lossy().to_string();
            let known = self
                .store
                .get_source(&Store::source_id_for(&self.device.device_id, &locator))?
                .is_some();
            let source = self.store.register_source(&SourceRegistration {
                kind: SourceKind::Git.as_str().to_string(),
                locator: locator.clone(),
                device_id: self.device.device_id.clone(),
                redact_secrets: false,
            })?;
            if !known {
                new_sources += 1;
                tracing::info!(locator = %locator, "registered git source");
            }
            let project_id = self.ensure_project(&root)?;
            self.source_meta.insert(
                source.source_id.clone(),
                SourceMeta {
                    project_id,
                    session_id: None,
                },
            );
        }

        Ok(new_sources)
    }

    fn ensure_project(&self, dir: &Path) -> Result<Option<String>> {
        match identity::detect_project(dir) {
            Ok(project) => {
                self.store.upsert_project(&project)?;
                Ok(Some(project.project_id))
            }
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "project detection failed");
                Ok(None)
            }
        }
    }

    /// Ingest every non-paused source. Errors are captured per source.
    pub fn ingest_all(&mut self) -> Result<IngestSummary> {
        let mut summary = IngestSummary {
            new_sources: self.auto_register()?,
            ..Default::default()
        };

        let sources = self.store.list_sources(None)?;
        for source in sources {
            if source.status == "paused" {
                continue;
            }
            let outcome = self.ingest_source(&source)?;
            summary.outcomes.push(outcome);
        }
        Ok(summary)
    }

    /// One ingest tick for one source: adapter read, redaction, atomic
    /// batch + cursor commit, status bookkeeping.
    pub fn ingest_source(&mut self, source: &SourceRow) -> Result<SourceOutcome> {
        let Some(kind) = SourceKind::parse(&source.kind) else {
            self.store
                .set_source_status(&source.source_id, "error", Some("unknown source kind"))?;
            return Ok(SourceOutcome {
                source_id: source.source_id.clone(),
                locator: source.locator.clone(),
                inserted: 0,
                report: IngestReport::default(),
                status: "error".into(),
            });
        };
        let Some(adapter) = self.registry.get(kind) else {
            return Ok(SourceOutcome {
                source_id: source.source_id.clone(),
                locator: source.locator.clone(),
                inserted: 0,
                report: IngestReport::default(),
                status: source.status.clone(),
            });
        };

        let meta = self
            .source_meta
            .get(&source.source_id)
            .cloned()
            .unwrap_or_else(|| SourceMeta {
                project_id: None,
                session_id: session_from_locator(kind, &source.locator),
            });
        let ctx = NormalizeContext {
            source_id: source.source_id.clone(),
            device_id: source.device_id.clone(),
            project_id: meta.project_id.clone(),
            session_id: meta.session_id.clone(),
            source_kind: kind,
            redact_secrets: source.redact_secrets,
        };

        let cursor = self.store.get_cursor(&source.source_id)?;
        match adapter.ingest(&source.locator, cursor.as_ref(), &ctx) {
            Ok(output) => {
                let events: Vec<StoredEvent> = output
                    .events
                    .into_iter()
                    .map(|draft| finalize(draft, &ctx))
                    .collect();
                let inserted = self
                    .store
                    .commit_batch(&events, &output.new_cursor)
                    .context("committing event batch")?;
                self.store.touch_source(&source.source_id)?;
                tracing::debug!(
                    source = %source.locator,
                    emitted = events.len(),
                    inserted,
                    "ingest tick"
                );
                Ok(SourceOutcome {
                    source_id: source.source_id.clone(),
                    locator: source.locator.clone(),
                    inserted,
                    report: output.report,
                    status: "active".into(),
                })
            }
            Err(e) if e.is_missing() => {
                // The last good cursor survives; rediscovery resumes the
                // source when its input reappears.
                self.store
                    .set_source_status(&source.source_id, "missing", None)?;
                tracing::info!(source = %source.locator, "source input missing");
                Ok(SourceOutcome {
                    source_id: source.source_id.clone(),
                    locator: source.locator.clone(),
                    inserted: 0,
                    report: IngestReport::default(),
                    status: "missing".into(),
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.store
                    .set_source_status(&source.source_id, "error", Some(&message))?;
                tracing::warn!(source = %source.locator, error = %message, "ingest failed");
                Ok(SourceOutcome {
                    source_id: source.source_id.clone(),
                    locator: source.locator.clone(),
                    inserted: 0,
                    report: IngestReport::default(),
                    status: "error".into(),
                })
            }
        }
    }

    /// Ingest a single source by id (used by the watch coordinator).
    pub fn ingest_source_id(&mut self, source_id: &str) -> Result<Option<SourceOutcome>> {
        match self.store.get_source(source_id)? {
            Some(source) if source.status != "paused" => {
                Ok(Some(self.ingest_source(&source)?))
            }
            _ => Ok(None),
        }
    }
}

fn session_from_locator(kind: SourceKind, locator: &str) -> Option<String> {
    match kind {
        SourceKind::Git => None,
        _ => Path::new(locator)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(String::from),
    }
}

/// Apply redaction policy and assign the stable event id.
fn finalize(draft: EventDraft, ctx: &NormalizeContext) -> StoredEvent {
    let payload_hash = draft.payload_hash();
    let event_id = crate::adapter::make_event_id(&ctx.source_id, draft.source_seq, &payload_hash);

    let redactable = ctx.redact_secrets && draft.event_type.is_redactable();

    let mut manifest_json = None;
    let text_redacted = draft.text.map(|text| {
        if redactable {
            let outcome = redact::redact(&text);
            if outcome.had_redactions {
                manifest_json = serde_json::to_string(&outcome.manifest).ok();
            }
            outcome.text
        } else {
            text
        }
    });

    let tool_args_json = draft.tool_args.map(|mut args| {
        if redactable {
            redact::redact_json(&mut args);
        }
        args.to_string()
    });

    StoredEvent {
        event_id,
        source_id: ctx.source_id.clone(),
        source_seq: draft.source_seq,
        device_id: ctx.device_id.clone(),
        project_id: ctx.project_id.clone(),
        session_id: draft.session_id.or_else(|| ctx.session_id.clone()),
        event_ts: draft.event_ts,
        ingest_ts: timeutil::to_rfc3339_z(&Utc::now()),
        source_kind: ctx.source_kind.as_str().to_string(),
        event_type: draft.event_type.as_str().to_string(),
        text_redacted,
        tool_name: draft.tool_name,
        tool_args_json,
        file_paths_json: if draft.file_paths.is_empty() {
            None
        } else {
            serde_json::to_string(&draft.file_paths).ok()
        },
        meta_json: draft.meta.map(|m| m.to_string()),
        redaction_manifest_json: manifest_json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::JsonlAdapter;
    use crate::store::query::QueryFilters;
    use tempfile::TempDir;

    fn device() -> Device {
        Device {
            device_id: "dev_test".into(),
            nickname: "test-host".into(),
            created_at: "2025-01-01T00:00:00.000Z".into(),
            last_seen_at: None,
        }
    }

    fn registry_for(base: &Path) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new(&crate::config::Config {
            adapters: [
                ("splitfile".to_string(), disabled()),
                ("plaintext".to_string(), disabled()),
                ("git".to_string(), disabled()),
                ("jsonl".to_string(), disabled()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        });
        registry.register(Box::new(JsonlAdapter::new(Some(base.to_path_buf()))));
        registry
    }

    fn disabled() -> crate::config::AdapterConfig {
        crate::config::AdapterConfig {
            enabled: false,
            base_path: None,
            author: None,
        }
    }

    fn write_session(base: &Path, lines: &[serde_json::Value]) -> std::path::PathBuf {
        let dir = base.join("proj-hash");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ses_abc.jsonl");
        let content: String = lines.iter().map(|l| format!("{l}\n")).collect();
        std::fs::write(&path, content).unwrap();
        path
    }

    fn user_entry(text: &str) -> serde_json::Value {
        serde_json::json!({
            "type": "user",
            "uuid": "u-1",
            "timestamp": "2025-03-01T10:00:00Z",
            "cwd": "/tmp",
            "message": {"role": "user", "content": text},
        })
    }

    #[test]
    fn end_to_end_ingest_with_redaction() {
        let base = TempDir::new().unwrap();
        write_session(
            base.path(),
            &[user_entry("token is sk-ABCDEFGHIJKLMNOPQRSTUVWX")],
        );

        let mut orch = Orchestrator::new(
            Store::open_in_memory().unwrap(),
            registry_for(base.path()),
            device(),
            true,
        )
        .unwrap();

        let summary = orch.ingest_all().unwrap();
        assert!(summary.new_sources >= 1);
        assert_eq!(orch.store().count_events().unwrap(), 1);

        let timeline = orch.store().timeline(&QueryFilters::with_limit(10)).unwrap();
        let event = &timeline.events[0];
        assert_eq!(
            event.text_redacted.as_deref(),
            Some("token is [REDACTED:api_key]")
        );
        let manifest: crate::redact::RedactionManifest =
            serde_json::from_str(event.redaction_manifest_json.as_ref().unwrap()).unwrap();
        assert_eq!(manifest.redactions.len(), 1);
        assert_eq!(manifest.redactions[0].start, 9);
        assert_eq!(event.session_id.as_deref(), Some("ses_abc"));
    }

    #[test]
    fn reingest_is_idempotent_end_to_end() {
        let base = TempDir::new().unwrap();
        let path = write_session(base.path(), &[user_entry("L1"), user_entry("L2")]);

        let mut orch = Orchestrator::new(
            Store::open_in_memory().unwrap(),
            registry_for(base.path()),
            device(),
            true,
        )
        .unwrap();

        orch.ingest_all().unwrap();
        assert_eq!(orch.store().count_events().unwrap(), 2);

        // Nothing changed: zero new rows.
        let summary = orch.ingest_all().unwrap();
        assert_eq!(orch.store().count_events().unwrap(), 2);
        assert_eq!(summary.outcomes.iter().map(|o| o.inserted).sum::<usize>(), 0);

        // Appending adds exactly one more.
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str(&format!("{}\n", user_entry("L3")));
        std::fs::write(&path, content).unwrap();
        orch.ingest_all().unwrap();
        assert_eq!(orch.store().count_events().unwrap(), 3);
    }

    #[test]
    fn vanished_source_goes_missing_and_keeps_cursor() {
        let base = TempDir::new().unwrap();
        let path = write_session(base.path(), &[user_entry("L1")]);

        let mut orch = Orchestrator::new(
            Store::open_in_memory().unwrap(),
            registry_for(base.path()),
            device(),
            true,
        )
        .unwrap();
        orch.ingest_all().unwrap();

        let source_id = Store::source_id_for("dev_test", &path.to_string_lossy());
        let cursor_before = orch.store().get_cursor(&source_id).unwrap().unwrap();

        std::fs::remove_file(&path).unwrap();
        // Auto-register no longer sees the file, but the source row remains.
        let source = orch.store().get_source(&source_id).unwrap().unwrap();
        let outcome = orch.ingest_source(&source).unwrap();
        assert_eq!(outcome.status, "missing");

        let source = orch.store().get_source(&source_id).unwrap().unwrap();
        assert_eq!(source.status, "missing");
        let cursor_after = orch.store().get_cursor(&source_id).unwrap().unwrap();
        assert_eq!(cursor_before.byte_offset, cursor_after.byte_offset);
    }

    #[test]
    fn paused_sources_are_skipped() {
        let base = TempDir::new().unwrap();
        let path = write_session(base.path(), &[user_entry("L1")]);

        let mut orch = Orchestrator::new(
            Store::open_in_memory().unwrap(),
            registry_for(base.path()),
            device(),
            true,
        )
        .unwrap();
        orch.auto_register().unwrap();

        let source_id = Store::source_id_for("dev_test", &path.to_string_lossy());
        orch.store
            .set_source_status(&source_id, "paused", None)
            .unwrap();

        orch.ingest_all().unwrap();
        assert_eq!(orch.store().count_events().unwrap(), 0);
    }

    #[test]
    fn assistant_text_is_not_redacted() {
        let base = TempDir::new().unwrap();
        write_session(
            base.path(),
            &[serde_json::json!({
                "type": "assistant",
                "timestamp": "2025-03-01T10:00:00Z",
                "message": {"role": "assistant",
                            "content": "use sk-ABCDEFGHIJKLMNOPQRSTUVWX as the key"},
            })],
        );

        let mut orch = Orchestrator::new(
            Store::open_in_memory().unwrap(),
            registry_for(base.path()),
            device(),
            true,
        )
        .unwrap();
        orch.ingest_all().unwrap();

        let timeline = orch.store().timeline(&QueryFilters::with_limit(10)).unwrap();
        assert!(timeline.events[0]
            .text_redacted
            .as_deref()
            .unwrap()
            .contains("sk-ABCDEFGHIJKLMNOPQRSTUVWX"));
        assert!(timeline.events[0].redaction_manifest_json.is_none());
    }
}

//! Event storage with SQLite.
//!
//! Single embedded database holding devices, projects, sources, cursors and
//! the canonical event log, with an FTS5 mirror over searchable text kept in
//! sync by triggers. The store is the process's single writer; batch inserts
//! and the cursor upsert for a tick share one transaction.

mod schema;

pub mod query;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::adapter::Cursor;
use crate::identity::{Device, Project};
use crate::timeutil;

/// A fully normalized event ready for insertion.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event_id: String,
    pub source_id: String,
    pub source_seq: f64,
    pub device_id: String,
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub event_ts: String,
    pub ingest_ts: String,
    pub source_kind: String,
    pub event_type: String,
    pub text_redacted: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args_json: Option<String>,
    pub file_paths_json: Option<String>,
    pub meta_json: Option<String>,
    pub redaction_manifest_json: Option<String>,
}

/// An event row read back from the store.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub event_id: String,
    pub source_id: String,
    pub source_seq: f64,
    pub device_id: String,
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub event_ts: String,
    pub ingest_ts: String,
    pub source_kind: String,
    pub event_type: String,
    pub text_redacted: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args_json: Option<String>,
    pub file_paths_json: Option<String>,
    pub meta_json: Option<String>,
    pub redaction_manifest_json: Option<String>,
}

impl EventRow {
    pub fn meta(&self) -> Option<serde_json::Value> {
        self.meta_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    pub fn tool_args(&self) -> Option<serde_json::Value> {
        self.tool_args_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.file_paths_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }
}

/// A registered source row.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub source_id: String,
    pub kind: String,
    pub locator: String,
    pub device_id: String,
    pub status: String,
    pub error_message: Option<String>,
    pub last_seen_at: Option<String>,
    pub redact_secrets: bool,
    pub retain_on_delete: bool,
    pub encrypt_originals: bool,
    pub created_at: String,
}

/// Parameters for registering a source.
#[derive(Debug, Clone)]
pub struct SourceRegistration {
    pub kind: String,
    pub locator: String,
    pub device_id: String,
    pub redact_secrets: bool,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
        let mut conn = Connection::open(path)
            .with_context(|| format!("opening database at {}", path.display()))?;
        apply_pragmas(&conn)?;
        schema::migrate(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::migrate(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Devices ───────────────────────────────────────────────────────

    pub fn upsert_device(&self, device: &Device) -> Result<()> {
        self.conn.execute(
            "INSERT INTO devices (device_id, nickname, created_at, last_seen_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
            params![
                device.device_id,
                device.nickname,
                device.created_at,
                device.last_seen_at
            ],
        )?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn upsert_project(&self, project: &Project) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO projects
             (project_id, display_name, git_remote, root_path, share_policy, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                project.project_id,
                project.display_name,
                project.git_remote,
                project.root_path,
                project.share_policy,
                project.created_at
            ],
        )?;
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, display_name, git_remote, root_path, share_policy, created_at
             FROM projects ORDER BY display_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Project {
                project_id: row.get(0)?,
                display_name: row.get(1)?,
                git_remote: row.get(2)?,
                root_path: row.get(3)?,
                share_policy: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ── Sources ───────────────────────────────────────────────────────

    /// Deterministic source id: stable across re-registrations of the same
    /// locator on the same device.
    pub fn source_id_for(device_id: &str, locator: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{device_id}:{locator}"));
        format!("src_{}", &hex::encode(hasher.finalize())[..16])
    }

    /// Get-or-create on `(device_id, locator)`.
    pub fn register_source(&self, reg: &SourceRegistration) -> Result<SourceRow> {
        let source_id = Self::source_id_for(&reg.device_id, &reg.locator);
        self.conn.execute(
            "INSERT OR IGNORE INTO sources
             (source_id, kind, locator, device_id, status, redact_secrets, created_at)
             VALUES (?, ?, ?, ?, 'active', ?, ?)",
            params![
                source_id,
                reg.kind,
                reg.locator,
                reg.device_id,
                reg.redact_secrets,
                timeutil::to_rfc3339_z(&Utc::now()),
            ],
        )?;
        self.get_source(&source_id)?
            .context("source row missing after registration")
    }

    pub fn get_source(&self, source_id: &str) -> Result<Option<SourceRow>> {
        self.conn
            .query_row(
                "SELECT source_id, kind, locator, device_id, status, error_message,
                        last_seen_at, redact_secrets, retain_on_delete, encrypt_originals,
                        created_at
                 FROM sources WHERE source_id = ?",
                params![source_id],
                row_to_source,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_sources(&self, status: Option<&str>) -> Result<Vec<SourceRow>> {
        let base = "SELECT source_id, kind, locator, device_id, status, error_message,
                           last_seen_at, redact_secrets, retain_on_delete, encrypt_originals,
                           created_at
                    FROM sources";
        let rows = match status {
            Some(s) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{base} WHERE status = ? ORDER BY locator"))?;
                let rows = stmt.query_map(params![s], row_to_source)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{base} ORDER BY locator"))?;
                let rows = stmt.query_map([], row_to_source)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    pub fn set_source_status(
        &self,
        source_id: &str,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE sources SET status = ?, error_message = ? WHERE source_id = ?",
            params![status, error_message, source_id],
        )?;
        Ok(())
    }

    /// Mark a successful ingest: active status, fresh last_seen_at.
    pub fn touch_source(&self, source_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sources
             SET status = 'active', error_message = NULL, last_seen_at = ?
             WHERE source_id = ?",
            params![timeutil::to_rfc3339_z(&Utc::now()), source_id],
        )?;
        Ok(())
    }

    /// Remove a source. With `purge`, its events go too; otherwise they are
    /// kept. The cursor row always goes with the source.
    pub fn delete_source(&mut self, source_id: &str, purge: bool) -> Result<()> {
        let tx = self.conn.transaction()?;
        if purge {
            tx.execute("DELETE FROM events WHERE source_id = ?", params![source_id])?;
        }
        tx.execute("DELETE FROM cursors WHERE source_id = ?", params![source_id])?;
        tx.execute(
            "DELETE FROM ciphertexts WHERE source_id = ?",
            params![source_id],
        )?;
        tx.execute("DELETE FROM sources WHERE source_id = ?", params![source_id])?;
        tx.commit()?;
        Ok(())
    }

    // ── Cursors ───────────────────────────────────────────────────────

    pub fn get_cursor(&self, source_id: &str) -> Result<Option<Cursor>> {
        self.conn
            .query_row(
                "SELECT source_id, file_inode, file_size, file_mtime, byte_offset,
                        diff_mtime, last_event_id, last_rowid, updated_at
                 FROM cursors WHERE source_id = ?",
                params![source_id],
                |row| {
                    Ok(Cursor {
                        source_id: row.get(0)?,
                        file_inode: row.get(1)?,
                        file_size: row.get(2)?,
                        file_mtime: row.get(3)?,
                        byte_offset: row.get(4)?,
                        diff_mtime: row.get(5)?,
                        last_event_id: row.get(6)?,
                        last_rowid: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    // ── Events ────────────────────────────────────────────────────────

    /// Insert a batch of events and upsert the source's cursor in one
    /// transaction. Duplicate event ids are silently ignored, preserving
    /// idempotence of re-ingestion. Returns the number of rows inserted.
    pub fn commit_batch(&mut self, events: &[StoredEvent], cursor: &Cursor) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO events
                 (event_id, source_id, source_seq, device_id, project_id, session_id,
                  event_ts, ingest_ts, source_kind, event_type, text_redacted, tool_name,
                  tool_args_json, file_paths, meta_json, redaction_manifest_json)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for event in events {
                inserted += stmt.execute(params![
                    event.event_id,
                    event.source_id,
                    event.source_seq,
                    event.device_id,
                    event.project_id,
                    event.session_id,
                    event.event_ts,
                    event.ingest_ts,
                    event.source_kind,
                    event.event_type,
                    event.text_redacted,
                    event.tool_name,
                    event.tool_args_json,
                    event.file_paths_json,
                    event.meta_json,
                    event.redaction_manifest_json,
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO cursors
             (source_id, file_inode, file_size, file_mtime, byte_offset, diff_mtime,
              last_event_id, last_rowid, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_id) DO UPDATE SET
                 file_inode = excluded.file_inode,
                 file_size = excluded.file_size,
                 file_mtime = excluded.file_mtime,
                 byte_offset = excluded.byte_offset,
                 diff_mtime = excluded.diff_mtime,
                 last_event_id = excluded.last_event_id,
                 last_rowid = excluded.last_rowid,
                 updated_at = excluded.updated_at",
            params![
                cursor.source_id,
                cursor.file_inode,
                cursor.file_size,
                cursor.file_mtime,
                cursor.byte_offset,
                cursor.diff_mtime,
                cursor.last_event_id,
                cursor.last_rowid,
                timeutil::to_rfc3339_z(&Utc::now()),
            ],
        )?;
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<EventRow>> {
        self.conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events e WHERE e.event_id = ?"),
                params![event_id],
                row_to_event,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn count_events(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
            .map_err(Into::into)
    }
}

// Always selected through the alias `e`; the FTS join would otherwise make
// text_redacted and tool_name ambiguous.
pub(crate) const EVENT_COLUMNS: &str = "e.event_id, e.source_id, e.source_seq, e.device_id, \
     e.project_id, e.session_id, e.event_ts, e.ingest_ts, e.source_kind, e.event_type, \
     e.text_redacted, e.tool_name, e.tool_args_json, e.file_paths, e.meta_json, \
     e.redaction_manifest_json";

pub(crate) fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        event_id: row.get(0)?,
        source_id: row.get(1)?,
        source_seq: row.get(2)?,
        device_id: row.get(3)?,
        project_id: row.get(4)?,
        session_id: row.get(5)?,
        event_ts: row.get(6)?,
        ingest_ts: row.get(7)?,
        source_kind: row.get(8)?,
        event_type: row.get(9)?,
        text_redacted: row.get(10)?,
        tool_name: row.get(11)?,
        tool_args_json: row.get(12)?,
        file_paths_json: row.get(13)?,
        meta_json: row.get(14)?,
        redaction_manifest_json: row.get(15)?,
    })
}

fn row_to_source(row: &rusqlite::Row) -> rusqlite::Result<SourceRow> {
    Ok(SourceRow {
        source_id: row.get(0)?,
        kind: row.get(1)?,
        locator: row.get(2)?,
        device_id: row.get(3)?,
        status: row.get(4)?,
        error_message: row.get(5)?,
        last_seen_at: row.get(6)?,
        redact_secrets: row.get(7)?,
        retain_on_delete: row.get(8)?,
        encrypt_originals: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// In-memory store with one device/project/source wired up.
    pub fn store_with_source() -> (Store, SourceRow) {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_device(&Device {
                device_id: "dev_test".into(),
                nickname: "test-host".into(),
                created_at: "2025-01-01T00:00:00.000Z".into(),
                last_seen_at: None,
            })
            .unwrap();
        let source = store
            .register_source(&SourceRegistration {
                kind: "jsonl_transcript".into(),
                locator: "/tmp/session.jsonl".into(),
                device_id: "dev_test".into(),
                redact_secrets: true,
            })
            .unwrap();
        (store, source)
    }

    pub fn make_event(source: &SourceRow, seq: f64, event_type: &str, text: &str) -> StoredEvent {
        let draft_ts = format!("2025-03-01T10:{:02}:00.000Z", (seq as i64) % 60);
        StoredEvent {
            event_id: crate::adapter::make_event_id(&source.source_id, seq, text),
            source_id: source.source_id.clone(),
            source_seq: seq,
            device_id: source.device_id.clone(),
            project_id: None,
            session_id: Some("ses_test".into()),
            event_ts: draft_ts,
            ingest_ts: "2025-03-01T12:00:00.000Z".into(),
            source_kind: source.kind.clone(),
            event_type: event_type.into(),
            text_redacted: Some(text.into()),
            tool_name: None,
            tool_args_json: None,
            file_paths_json: None,
            meta_json: None,
            redaction_manifest_json: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn batch_insert_is_idempotent() {
        let (mut store, source) = store_with_source();
        let events = vec![
            make_event(&source, 1.0, "user_message", "hello"),
            make_event(&source, 2.0, "assistant_message", "hi"),
        ];
        let cursor = Cursor {
            source_id: source.source_id.clone(),
            byte_offset: Some(100),
            ..Default::default()
        };

        assert_eq!(store.commit_batch(&events, &cursor).unwrap(), 2);
        // Same bytes again: zero new rows.
        assert_eq!(store.commit_batch(&events, &cursor).unwrap(), 0);
        assert_eq!(store.count_events().unwrap(), 2);
    }

    #[test]
    fn cursor_committed_with_batch() {
        let (mut store, source) = store_with_source();
        let events = vec![make_event(&source, 1.0, "user_message", "hello")];
        let cursor = Cursor {
            source_id: source.source_id.clone(),
            file_inode: Some(42),
            byte_offset: Some(17),
            last_rowid: Some(1),
            ..Default::default()
        };
        store.commit_batch(&events, &cursor).unwrap();

        let stored = store.get_cursor(&source.source_id).unwrap().unwrap();
        assert_eq!(stored.file_inode, Some(42));
        assert_eq!(stored.byte_offset, Some(17));
        assert_eq!(stored.last_rowid, Some(1));
        assert!(stored.updated_at.is_some());
    }

    #[test]
    fn fts_mirror_tracks_inserts_and_deletes() {
        let (mut store, source) = store_with_source();
        let events = vec![make_event(&source, 1.0, "user_message", "needle in haystack")];
        let cursor = Cursor {
            source_id: source.source_id.clone(),
            ..Default::default()
        };
        store.commit_batch(&events, &cursor).unwrap();

        let hits: i64 = store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM events_fts WHERE events_fts MATCH 'needle'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        store.delete_source(&source.source_id, true).unwrap();
        let hits: i64 = store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM events_fts WHERE events_fts MATCH 'needle'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }

    #[test]
    fn delete_source_without_purge_keeps_events() {
        let (mut store, source) = store_with_source();
        let events = vec![make_event(&source, 1.0, "user_message", "kept")];
        let cursor = Cursor {
            source_id: source.source_id.clone(),
            ..Default::default()
        };
        store.commit_batch(&events, &cursor).unwrap();

        store.delete_source(&source.source_id, false).unwrap();
        assert!(store.get_source(&source.source_id).unwrap().is_none());
        assert!(store.get_cursor(&source.source_id).unwrap().is_none());
        assert_eq!(store.count_events().unwrap(), 1);
    }

    #[test]
    fn source_registration_is_stable() {
        let (store, source) = store_with_source();
        let again = store
            .register_source(&SourceRegistration {
                kind: "jsonl_transcript".into(),
                locator: "/tmp/session.jsonl".into(),
                device_id: "dev_test".into(),
                redact_secrets: true,
            })
            .unwrap();
        assert_eq!(source.source_id, again.source_id);
    }
}

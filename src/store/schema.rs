//! Forward-only schema migrations.
//!
//! `schema_version` records every applied version; on open, all pending
//! migrations run in order, each inside its own transaction with its
//! version row inserted at the end. A failed migration leaves no partial
//! schema behind.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;

pub const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1)];

const MIGRATION_V1: &str = r#"
CREATE TABLE devices (
    device_id TEXT PRIMARY KEY,
    nickname TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_seen_at TEXT
);

CREATE TABLE projects (
    project_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    git_remote TEXT,
    root_path TEXT NOT NULL,
    share_policy TEXT NOT NULL DEFAULT 'private',
    created_at TEXT NOT NULL
);

CREATE TABLE sources (
    source_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    locator TEXT NOT NULL,
    device_id TEXT NOT NULL REFERENCES devices(device_id),
    status TEXT NOT NULL DEFAULT 'active',
    error_message TEXT,
    last_seen_at TEXT,
    redact_secrets INTEGER NOT NULL DEFAULT 1,
    retain_on_delete INTEGER NOT NULL DEFAULT 0,
    encrypt_originals INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(device_id, locator)
);

CREATE TABLE cursors (
    source_id TEXT PRIMARY KEY REFERENCES sources(source_id) ON DELETE CASCADE,
    file_inode INTEGER,
    file_size INTEGER,
    file_mtime INTEGER,
    byte_offset INTEGER,
    diff_mtime INTEGER,
    last_event_id TEXT,
    last_rowid INTEGER,
    updated_at TEXT NOT NULL
);

-- Encrypted originals for sources with encrypt_originals set.
CREATE TABLE ciphertexts (
    ciphertext_id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES sources(source_id) ON DELETE CASCADE,
    event_id TEXT,
    nonce BLOB,
    ciphertext BLOB NOT NULL,
    created_at TEXT NOT NULL
);

-- source_id is deliberately not a foreign key: deleting a source without
-- purge keeps its events queryable.
CREATE TABLE events (
    event_id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    source_seq REAL NOT NULL,
    device_id TEXT NOT NULL,
    project_id TEXT,
    session_id TEXT,
    event_ts TEXT NOT NULL,
    ingest_ts TEXT NOT NULL,
    source_kind TEXT NOT NULL,
    event_type TEXT NOT NULL,
    text_redacted TEXT,
    tool_name TEXT,
    tool_args_json TEXT,
    file_paths TEXT,
    meta_json TEXT,
    redaction_manifest_json TEXT
);

CREATE INDEX idx_events_project ON events(project_id);
CREATE INDEX idx_events_session ON events(session_id);
CREATE INDEX idx_events_type ON events(event_type);
CREATE INDEX idx_events_ts ON events(event_ts);
CREATE INDEX idx_events_source_seq ON events(source_id, source_seq);
CREATE INDEX idx_events_ingest_ts ON events(ingest_ts);

CREATE VIRTUAL TABLE events_fts USING fts5(
    text_redacted,
    tool_name,
    content='events',
    content_rowid='rowid'
);

CREATE TRIGGER events_ai AFTER INSERT ON events BEGIN
    INSERT INTO events_fts(rowid, text_redacted, tool_name)
    VALUES (new.rowid, new.text_redacted, new.tool_name);
END;

CREATE TRIGGER events_ad AFTER DELETE ON events BEGIN
    INSERT INTO events_fts(events_fts, rowid, text_redacted, tool_name)
    VALUES ('delete', old.rowid, old.text_redacted, old.tool_name);
END;

CREATE TRIGGER events_au AFTER UPDATE ON events BEGIN
    INSERT INTO events_fts(events_fts, rowid, text_redacted, tool_name)
    VALUES ('delete', old.rowid, old.text_redacted, old.tool_name);
    INSERT INTO events_fts(rowid, text_redacted, tool_name)
    VALUES (new.rowid, new.text_redacted, new.tool_name);
END;
"#;

/// Apply all pending migrations. Each runs transactionally and records its
/// version; a crash mid-migration leaves the previous version intact.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .context("reading schema version")?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .with_context(|| format!("applying schema migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, datetime('now'))",
            [version],
        )?;
        tx.commit()?;
    }

    let applied: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    let expected = MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0);
    if applied != expected {
        bail!("schema version {applied} does not match expected {expected}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrates_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().0);

        for table in [
            "devices",
            "projects",
            "sources",
            "cursors",
            "ciphertexts",
            "events",
            "schema_version",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, MIGRATIONS.len() as i64);
    }
}

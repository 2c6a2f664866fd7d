//! Git repository adapter.
//!
//! Captures the local author's commits (subject, parents, per-file numstat)
//! and HEAD reflog branch switches as events. History is read through git
//! subprocesses with prompt-free environment hygiene; the first ingest looks
//! back 30 days, later ticks resume from the last ingest time.

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{
    Cursor, EventDraft, EventType, IngestOutput, IngestReport, NormalizeContext, SourceAdapter,
    SourceCandidate, SourceKind,
};
use crate::error::IngestError;
use crate::timeutil;

const FIELD_SEP: char = '\u{1}';
const LOOKBACK_DAYS: i64 = 30;

pub struct GitRepoAdapter {
    author_override: Option<String>,
}

#[derive(Debug)]
pub struct CommitInfo {
    pub sha: String,
    pub short_sha: String,
    pub subject: String,
    pub author_name: String,
    pub author_email: String,
    pub ts: String,
    pub unix_ts: i64,
    pub parents: Vec<String>,
    pub branch: Option<String>,
    pub files: Vec<CommitFile>,
}

#[derive(Debug)]
pub struct CommitFile {
    pub path: String,
    pub status: String,
    pub insertions: i64,
    pub deletions: i64,
}

#[derive(Debug)]
pub struct BranchSwitch {
    pub from: String,
    pub to: String,
    pub from_sha: Option<String>,
    pub to_sha: String,
    pub ts: String,
    pub unix_ts: i64,
}

impl GitRepoAdapter {
    pub fn new(author_override: Option<String>) -> Self {
        Self { author_override }
    }

    fn run_git(repo: &Path, args: &[&str]) -> Result<String, IngestError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "echo")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| IngestError::adapter(format!("spawning git: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(IngestError::adapter(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn author(&self, repo: &Path) -> Result<Option<String>, IngestError> {
        if let Some(author) = &self.author_override {
            return Ok(Some(author.clone()));
        }
        match Self::run_git(repo, &["config", "user.email"]) {
            Ok(email) => {
                let email = email.trim().to_string();
                Ok(if email.is_empty() { None } else { Some(email) })
            }
            Err(_) => Ok(None),
        }
    }

    /// Commits by the configured author since the given time.
    pub fn commits_since(
        &self,
        repo: &Path,
        since_iso: &str,
    ) -> Result<Vec<CommitInfo>, IngestError> {
        let author = self.author(repo)?;
        let format = format!(
            "--pretty=format:%x02%H{s}%h{s}%s{s}%an{s}%ae{s}%aI{s}%at{s}%P",
            s = FIELD_SEP
        );
        let mut args: Vec<String> = vec![
            "log".into(),
            format,
            "--numstat".into(),
            format!("--since={since_iso}"),
        ];
        if let Some(author) = &author {
            args.push(format!("--author={author}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let numstat_out = match Self::run_git(repo, &arg_refs) {
            Ok(out) => out,
            // An empty repository has no HEAD yet.
            Err(_) => return Ok(vec![]),
        };

        let statuses = self.file_statuses(repo, since_iso, author.as_deref())?;

        let mut commits: Vec<CommitInfo> = vec![];
        for record in numstat_out.split('\u{2}').skip(1) {
            let mut lines = record.lines();
            let Some(header) = lines.next() else { continue };
            let fields: Vec<&str> = header.split(FIELD_SEP).collect();
            if fields.len() < 8 {
                continue;
            }
            let sha = fields[0].to_string();
            let ts = timeutil::normalize_source_ts(fields[5])
                .unwrap_or_else(|| fields[5].to_string());
            let unix_ts: i64 = fields[6].parse().unwrap_or(0);

            let mut files = vec![];
            for line in lines {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                let cols: Vec<&str> = line.splitn(3, '\t').collect();
                if cols.len() != 3 {
                    continue;
                }
                let insertions = cols[0].parse().unwrap_or(0);
                let deletions = cols[1].parse().unwrap_or(0);
                let path = normalize_rename_path(cols[2]);
                let status = statuses
                    .get(&(sha.clone(), path.clone()))
                    .cloned()
                    .unwrap_or_else(|| "M".to_string());
                files.push(CommitFile {
                    path,
                    status,
                    insertions,
                    deletions,
                });
            }

            let branch = self.branch_containing(repo, &sha);
            commits.push(CommitInfo {
                sha,
                short_sha: fields[1].to_string(),
                subject: fields[2].to_string(),
                author_name: fields[3].to_string(),
                author_email: fields[4].to_string(),
                ts,
                unix_ts,
                parents: fields[7]
                    .split_whitespace()
                    .map(String::from)
                    .collect(),
                branch,
                files,
            });
        }
        commits.reverse(); // git log is newest-first; emit oldest-first
        Ok(commits)
    }

    fn file_statuses(
        &self,
        repo: &Path,
        since_iso: &str,
        author: Option<&str>,
    ) -> Result<HashMap<(String, String), String>, IngestError> {
        let format = format!("--pretty=format:%x02%H{}", FIELD_SEP);
        let mut args: Vec<String> = vec![
            "log".into(),
            format,
            "--name-status".into(),
            format!("--since={since_iso}"),
        ];
        if let Some(author) = author {
            args.push(format!("--author={author}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = match Self::run_git(repo, &arg_refs) {
            Ok(out) => out,
            Err(_) => return Ok(HashMap::new()),
        };

        let mut statuses = HashMap::new();
        for record in out.split('\u{2}').skip(1) {
            let mut lines = record.lines();
            let Some(header) = lines.next() else { continue };
            let sha = header.trim_end_matches(FIELD_SEP).to_string();
            for line in lines {
                let cols: Vec<&str> = line.split('\t').collect();
                if cols.len() < 2 {
                    continue;
                }
                let status = cols[0].chars().next().unwrap_or('M').to_string();
                // Renames list old then new; the new path is canonical.
                let path = cols.last().unwrap_or(&"").to_string();
                if !path.is_empty() {
                    statuses.insert((sha.clone(), path), status);
                }
            }
        }
        Ok(statuses)
    }

    fn branch_containing(&self, repo: &Path, sha: &str) -> Option<String> {
        let out = Self::run_git(
            repo,
            &[
                "branch",
                "--contains",
                sha,
                "--format=%(refname:short)",
            ],
        )
        .ok()?;
        out.lines().map(str::trim).find(|l| !l.is_empty()).map(String::from)
    }

    /// HEAD reflog "checkout: moving from A to B" entries since the given
    /// unix time. The prior entry's sha doubles as the switch's from-sha.
    pub fn branch_switches_since(
        &self,
        repo: &Path,
        since_unix: i64,
    ) -> Result<Vec<BranchSwitch>, IngestError> {
        let out = match Self::run_git(
            repo,
            &[
                "reflog",
                "show",
                "HEAD",
                &format!("--format=%H{s}%ct{s}%gs", s = FIELD_SEP),
            ],
        ) {
            Ok(out) => out,
            Err(_) => return Ok(vec![]),
        };

        // Newest first; each entry's predecessor in the log is its prior state.
        let entries: Vec<(String, i64, String)> = out
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split(FIELD_SEP).collect();
                if fields.len() != 3 {
                    return None;
                }
                Some((
                    fields[0].to_string(),
                    fields[1].parse().ok()?,
                    fields[2].to_string(),
                ))
            })
            .collect();

        let mut switches = vec![];
        for (i, (sha, unix_ts, subject)) in entries.iter().enumerate() {
            if *unix_ts < since_unix {
                continue;
            }
            let Some(rest) = subject.strip_prefix("checkout: moving from ") else {
                continue;
            };
            let Some((from, to)) = rest.split_once(" to ") else {
                continue;
            };
            switches.push(BranchSwitch {
                from: from.to_string(),
                to: to.to_string(),
                from_sha: entries.get(i + 1).map(|(prev_sha, _, _)| prev_sha.clone()),
                to_sha: sha.clone(),
                ts: timeutil::to_rfc3339_z(
                    &Utc.timestamp_opt(*unix_ts, 0).single().unwrap_or_else(Utc::now),
                ),
                unix_ts: *unix_ts,
            });
        }
        switches.reverse();
        Ok(switches)
    }
}

impl SourceAdapter for GitRepoAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Git
    }

    /// Repositories are registered from the transcript adapters' working
    /// directories rather than scanned from disk.
    fn discover(&self) -> Result<Vec<SourceCandidate>> {
        Ok(vec![])
    }

    fn ingest(
        &self,
        locator: &str,
        cursor: Option<&Cursor>,
        ctx: &NormalizeContext,
    ) -> Result<IngestOutput, IngestError> {
        let repo = Path::new(locator);
        if !repo.join(".git").exists() {
            return Err(IngestError::missing(format!("repository vanished: {locator}")));
        }

        let since_unix = cursor
            .and_then(|c| c.file_mtime)
            .unwrap_or_else(|| (Utc::now() - Duration::days(LOOKBACK_DAYS)).timestamp());
        let since_iso = timeutil::to_rfc3339_z(
            &Utc.timestamp_opt(since_unix, 0).single().unwrap_or_else(Utc::now),
        );

        let mut events = vec![];
        let mut report = IngestReport::default();

        for commit in self.commits_since(repo, &since_iso)? {
            let total_insertions: i64 = commit.files.iter().map(|f| f.insertions).sum();
            let total_deletions: i64 = commit.files.iter().map(|f| f.deletions).sum();
            let files: Vec<Value> = commit
                .files
                .iter()
                .map(|f| {
                    json!({
                        "path": f.path,
                        "status": f.status,
                        "insertions": f.insertions,
                        "deletions": f.deletions,
                    })
                })
                .collect();

            let mut draft = EventDraft::new(
                commit.unix_ts as f64,
                commit.ts.clone(),
                EventType::GitCommit,
            );
            draft.text = Some(commit.subject.clone());
            draft.file_paths = commit.files.iter().map(|f| f.path.clone()).collect();
            draft.meta = Some(json!({
                "sha": commit.sha,
                "short_sha": commit.short_sha,
                "author_name": commit.author_name,
                "author_email": commit.author_email,
                "parents": commit.parents,
                "branch": commit.branch,
                "insertions": total_insertions,
                "deletions": total_deletions,
                "files": files,
            }));
            events.push(draft);
        }

        for switch in self.branch_switches_since(repo, since_unix)? {
            let mut draft = EventDraft::new(
                switch.unix_ts as f64 + 0.5,
                switch.ts.clone(),
                EventType::GitBranch,
            );
            draft.text = Some(format!("checkout: {} -> {}", switch.from, switch.to));
            draft.meta = Some(json!({
                "from": switch.from,
                "to": switch.to,
                "from_sha": switch.from_sha,
                "to_sha": switch.to_sha,
            }));
            events.push(draft);
        }

        report.events_emitted = events.len();
        let new_cursor = Cursor {
            source_id: ctx.source_id.clone(),
            file_inode: None,
            file_size: None,
            file_mtime: Some(Utc::now().timestamp()),
            byte_offset: None,
            diff_mtime: None,
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

/// `a/{old => new}/b` and `old => new` rename forms collapse to the new path.
fn normalize_rename_path(path: &str) -> String {
    if let (Some(open), Some(close)) = (path.find('{'), path.find('}')) {
        if let Some(arrow) = path[open..close].find(" => ") {
            let new_part = &path[open + arrow + 4..close];
            return format!("{}{}{}", &path[..open], new_part, &path[close + 1..])
                .replace("//", "/");
        }
    }
    if let Some((_, new)) = path.split_once(" => ") {
        return new.to_string();
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git(repo: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(repo)
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("git available");
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let repo = dir.path();
        git(repo, &["init", "-q", "-b", "main"]);
        git(repo, &["config", "user.email", "me@example.com"]);
        git(repo, &["config", "user.name", "Me"]);
        std::fs::write(repo.join("a.txt"), "one\ntwo\n").unwrap();
        git(repo, &["add", "a.txt"]);
        git(repo, &["commit", "-q", "-m", "add a.txt"]);
        dir
    }

    fn ctx() -> NormalizeContext {
        NormalizeContext {
            source_id: "src_git".into(),
            device_id: "dev_test".into(),
            project_id: None,
            session_id: None,
            source_kind: SourceKind::Git,
            redact_secrets: false,
        }
    }

    #[test]
    fn rename_paths_normalize() {
        assert_eq!(normalize_rename_path("src/{old.rs => new.rs}"), "src/new.rs");
        assert_eq!(normalize_rename_path("old.rs => new.rs"), "new.rs");
        assert_eq!(normalize_rename_path("plain.rs"), "plain.rs");
    }

    #[test]
    fn commits_become_events_with_numstat() {
        let dir = init_repo();
        let adapter = GitRepoAdapter::new(None);

        let out = adapter
            .ingest(&dir.path().to_string_lossy(), None, &ctx())
            .unwrap();
        let commit = out
            .events
            .iter()
            .find(|e| e.event_type == EventType::GitCommit)
            .expect("one commit event");
        assert_eq!(commit.text.as_deref(), Some("add a.txt"));
        let meta = commit.meta.as_ref().unwrap();
        assert_eq!(meta["author_email"], "me@example.com");
        assert_eq!(meta["insertions"], 2);
        assert_eq!(meta["files"][0]["path"], "a.txt");
        assert_eq!(meta["files"][0]["status"], "A");
        assert_eq!(commit.file_paths, vec!["a.txt".to_string()]);
    }

    #[test]
    fn author_filter_excludes_other_committers() {
        let dir = init_repo();
        let repo = dir.path();
        git(repo, &["config", "user.email", "other@example.com"]);
        std::fs::write(repo.join("b.txt"), "x\n").unwrap();
        git(repo, &["add", "b.txt"]);
        git(repo, &["commit", "-q", "-m", "by someone else"]);

        // Scope back to the original author.
        let adapter = GitRepoAdapter::new(Some("me@example.com".into()));
        let out = adapter.ingest(&repo.to_string_lossy(), None, &ctx()).unwrap();
        let subjects: Vec<&str> = out
            .events
            .iter()
            .filter(|e| e.event_type == EventType::GitCommit)
            .filter_map(|e| e.text.as_deref())
            .collect();
        assert_eq!(subjects, vec!["add a.txt"]);
    }

    #[test]
    fn branch_switches_are_captured() {
        let dir = init_repo();
        let repo = dir.path();
        git(repo, &["checkout", "-q", "-b", "feature/x"]);

        let adapter = GitRepoAdapter::new(None);
        let switches = adapter.branch_switches_since(repo, 0).unwrap();
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].from, "main");
        assert_eq!(switches[0].to, "feature/x");
        assert!(!switches[0].to_sha.is_empty());
    }

    #[test]
    fn second_ingest_emits_no_new_event_ids() {
        let dir = init_repo();
        let adapter = GitRepoAdapter::new(None);
        let locator = dir.path().to_string_lossy().to_string();

        let out1 = adapter.ingest(&locator, None, &ctx()).unwrap();
        assert!(!out1.events.is_empty());

        // A tick over an unchanged repo may re-read a boundary-second commit
        // but never produces an unseen event id.
        let ids = |out: &IngestOutput| {
            out.events
                .iter()
                .map(|e| crate::adapter::make_event_id("src_git", e.source_seq, &e.payload_hash()))
                .collect::<std::collections::HashSet<_>>()
        };
        let out2 = adapter
            .ingest(&locator, Some(&out1.new_cursor), &ctx())
            .unwrap();
        assert!(ids(&out2).is_subset(&ids(&out1)));
    }

    #[test]
    fn missing_repo_is_transient() {
        let adapter = GitRepoAdapter::new(None);
        let err = adapter
            .ingest("/nonexistent/repo", None, &ctx())
            .unwrap_err();
        assert!(err.is_missing());
    }
}

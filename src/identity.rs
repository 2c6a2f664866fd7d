//! Device identity and project detection.
//!
//! Device identity is a UUID persisted once to a user-config JSON file.
//! Project identity prefers the normalized git remote (stable across clones
//! on different machines) and falls back to the absolute root path.

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::timeutil;

/// Stable per-install identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub nickname: String,
    pub created_at: String,
    #[serde(default)]
    pub last_seen_at: Option<String>,
}

/// A detected project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub display_name: String,
    pub git_remote: Option<String>,
    pub root_path: String,
    pub share_policy: String,
    pub created_at: String,
}

/// Default location of the device identity file.
pub fn default_device_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("recall/device.json")
}

/// Load the persisted device identity, creating it on first call.
pub fn get_or_create_device(path: &Path) -> Result<Device> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading device identity at {}", path.display()))?;
        let mut device: Device =
            serde_json::from_str(&content).context("parsing device identity")?;
        device.last_seen_at = Some(timeutil::to_rfc3339_z(&Utc::now()));
        // Best-effort refresh of last_seen_at; identity itself is immutable.
        let _ = std::fs::write(path, serde_json::to_string_pretty(&device)?);
        return Ok(device);
    }

    let nickname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());

    let now = timeutil::to_rfc3339_z(&Utc::now());
    let device = Device {
        device_id: uuid::Uuid::new_v4().to_string(),
        nickname,
        created_at: now.clone(),
        last_seen_at: Some(now),
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&device)?)
        .with_context(|| format!("writing device identity at {}", path.display()))?;

    Ok(device)
}

/// Walk up from `dir` looking for a git repository root.
pub fn find_repo_root(dir: &Path) -> Option<PathBuf> {
    let mut current = if dir.is_file() { dir.parent()? } else { dir };
    loop {
        if current.join(".git").exists() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
}

// The origin url, scoped to the `[remote "origin"]` section: `[^\[]*`
// cannot cross into the next section header, and `\burl` rejects pushurl.
static ORIGIN_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[remote "origin"\][^\[]*\burl\s*=\s*(\S+)"#).unwrap());

/// Extract the origin remote URL from `.git/config`, if present.
pub fn extract_git_remote(repo_root: &Path) -> Option<String> {
    let config = std::fs::read_to_string(repo_root.join(".git/config")).ok()?;
    ORIGIN_URL_RE
        .captures(&config)
        .map(|caps| caps[1].to_string())
}

static SSH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^git@([^:]+):(.+)$").unwrap());
static SSH_PROTO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ssh://git@([^/]+?)(?::\d+)?/(.+)$").unwrap());
static HTTP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://(?:[^@/]+@)?([^/]+)/(.+)$").unwrap());

/// Collapse SSH and HTTPS remote forms to `host/owner/name`.
pub fn normalize_remote(url: &str) -> Option<String> {
    let (host, path) = if let Some(caps) = SSH_RE.captures(url) {
        (caps[1].to_string(), caps[2].to_string())
    } else if let Some(caps) = SSH_PROTO_RE.captures(url) {
        (caps[1].to_string(), caps[2].to_string())
    } else if let Some(caps) = HTTP_RE.captures(url) {
        (caps[1].to_string(), caps[2].to_string())
    } else {
        return None;
    };

    let path = path.trim_end_matches('/').trim_end_matches(".git");
    if path.is_empty() {
        return None;
    }
    Some(format!("{}/{}", host, path))
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the deterministic project id from a display name and identity key.
pub fn project_id_for(display_name: &str, identity_key: &str) -> String {
    let s = slug(display_name);
    let prefix: String = s.chars().take(20).collect();
    format!("{}-{}", prefix, &sha256_hex(identity_key)[..16])
}

/// Map a directory to a project.
///
/// Repositories key off the normalized remote when one exists (stable across
/// clones); everything else keys off the absolute root path.
pub fn detect_project(dir: &Path) -> Result<Project> {
    let root = find_repo_root(dir).unwrap_or_else(|| dir.to_path_buf());
    let root_path = root
        .canonicalize()
        .unwrap_or_else(|_| root.clone())
        .to_string_lossy()
        .to_string();

    let remote = extract_git_remote(&root).and_then(|url| normalize_remote(&url));

    let display_name = match &remote {
        Some(r) => r.rsplit('/').next().unwrap_or(r).to_string(),
        None => root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root_path.clone()),
    };

    let identity_key = remote.as_deref().unwrap_or(&root_path);

    Ok(Project {
        project_id: project_id_for(&display_name, identity_key),
        display_name,
        git_remote: remote,
        root_path,
        share_policy: "private".to_string(),
        created_at: timeutil::to_rfc3339_z(&Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn device_is_created_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.json");

        let first = get_or_create_device(&path).unwrap();
        let second = get_or_create_device(&path).unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.created_at, second.created_at);
        assert!(!first.nickname.is_empty());
    }

    #[test]
    fn ssh_and_https_remotes_collapse() {
        let ssh = normalize_remote("git@github.com:acme/widgets.git").unwrap();
        let https = normalize_remote("https://github.com/acme/widgets.git").unwrap();
        let proto = normalize_remote("ssh://git@github.com:22/acme/widgets").unwrap();
        assert_eq!(ssh, "github.com/acme/widgets");
        assert_eq!(ssh, https);
        assert_eq!(ssh, proto);
    }

    #[test]
    fn non_url_remote_is_rejected() {
        assert!(normalize_remote("../relative/path").is_none());
    }

    #[test]
    fn project_id_is_deterministic() {
        let a = project_id_for("Widgets", "github.com/acme/widgets");
        let b = project_id_for("Widgets", "github.com/acme/widgets");
        assert_eq!(a, b);
        assert!(a.starts_with("widgets-"));
        assert_eq!(a.len(), "widgets-".len() + 16);
    }

    #[test]
    fn slug_prefix_is_capped() {
        let id = project_id_for("A Very Long Project Name Indeed", "key");
        let prefix = id.rsplit_once('-').unwrap().0;
        assert!(prefix.len() <= 20);
    }

    #[test]
    fn detect_project_without_repo_uses_path() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("myproj");
        std::fs::create_dir_all(&sub).unwrap();

        let project = detect_project(&sub).unwrap();
        assert_eq!(project.display_name, "myproj");
        assert!(project.git_remote.is_none());
        assert!(project.project_id.starts_with("myproj-"));
    }

    #[test]
    fn detect_project_with_repo_uses_remote() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(
            root.join(".git/config"),
            "[remote \"origin\"]\n\turl = git@github.com:acme/widgets.git\n",
        )
        .unwrap();
        let nested = root.join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();

        let project = detect_project(&nested).unwrap();
        assert_eq!(project.display_name, "widgets");
        assert_eq!(
            project.git_remote.as_deref(),
            Some("github.com/acme/widgets")
        );
    }

    #[test]
    fn remote_extraction_is_scoped_to_origin() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(
            root.join(".git/config"),
            "[core]\n\tbare = false\n\
             [remote \"upstream\"]\n\turl = git@github.com:other/fork.git\n\
             [remote \"origin\"]\n\tpushurl = git@backup.example.com:acme/widgets.git\n\
             \turl = https://github.com/acme/widgets.git\n\
             [branch \"main\"]\n\tremote = origin\n",
        )
        .unwrap();

        assert_eq!(
            extract_git_remote(&root).as_deref(),
            Some("https://github.com/acme/widgets.git")
        );
    }

    #[test]
    fn missing_origin_yields_no_remote() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(
            root.join(".git/config"),
            "[remote \"upstream\"]\n\turl = git@github.com:other/fork.git\n",
        )
        .unwrap();

        assert!(extract_git_remote(&root).is_none());
    }
}

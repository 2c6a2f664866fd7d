//! File reconstruction from captured reads and edit streams.
//!
//! A substantially complete read snapshot wins outright; otherwise the edit
//! stream is replayed in order, seeding from the first edit's pre-image.
//! Edit streams are inherently imperfect (an intervening external write can
//! strip an `old_string` from the content), so replay is best-effort and the
//! report carries its fidelity.

use anyhow::Result;

use crate::error::NotReconstructible;
use crate::store::query::EditFilters;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Snapshot,
    Replay,
}

#[derive(Debug)]
pub struct Reconstruction {
    pub content: String,
    pub strategy: Strategy,
    pub applied: usize,
    pub failed: usize,
    pub total: usize,
}

/// Best-effort contents of `file_path` as of `at_time`.
pub fn reconstruct(
    store: &Store,
    file_path: &str,
    at_time: Option<&str>,
    session_id: Option<&str>,
) -> Result<Reconstruction> {
    if let Some(snapshot) = store.find_read_result(file_path, at_time)? {
        return Ok(Reconstruction {
            content: snapshot.content,
            strategy: Strategy::Snapshot,
            applied: 0,
            failed: 0,
            total: 0,
        });
    }

    let edits = store.get_edits(&EditFilters {
        until: at_time.map(String::from),
        session: session_id.map(String::from),
        file_path: Some(file_path.to_string()),
        limit: 100_000,
        ..Default::default()
    })?;

    if edits.is_empty() {
        return Err(NotReconstructible {
            file_path: file_path.to_string(),
        }
        .into());
    }

    // Seed from the first edit's pre-image, then replay every edit: the
    // seed's own replacement is edit one.
    let mut content = edits[0].old_string.clone();
    let mut applied = 0usize;
    let mut failed = 0usize;
    for edit in &edits {
        if content.contains(&edit.old_string) {
            content = content.replacen(&edit.old_string, &edit.new_string, 1);
            applied += 1;
        } else {
            failed += 1;
        }
    }

    Ok(Reconstruction {
        content,
        strategy: Strategy::Replay,
        applied,
        failed,
        total: edits.len(),
    })
}

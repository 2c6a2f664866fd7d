//! Reconstruct command implementation

use anyhow::Result;

use crate::reconstruct::{reconstruct, Strategy};
use crate::store::Store;

pub fn run(
    store: &Store,
    file_path: &str,
    at: Option<&str>,
    session: Option<&str>,
) -> Result<()> {
    let result = reconstruct(store, file_path, at, session)?;

    // Contents to stdout so the command pipes cleanly; report to stderr.
    print!("{}", result.content);
    match result.strategy {
        Strategy::Snapshot => eprintln!("(from read snapshot)"),
        Strategy::Replay => eprintln!(
            "(replayed {} edits: {} applied, {} failed)",
            result.total, result.applied, result.failed
        ),
    }
    Ok(())
}

//! Error taxonomy for the ingestion loop.
//!
//! Everything except store corruption and migration failure recovers
//! locally: a missing input parks the source as `missing` until rediscovery
//! sees it again, a malformed line is skipped and counted, an adapter
//! failure parks the source as `error` with the captured message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Input vanished mid-tick (file rotated away, repo moved). The source
    /// moves to `missing` and resumes when rediscovery finds it again.
    #[error("source input missing: {0}")]
    TransientIo(String),

    /// Adapter-level failure (git command failed, unreadable directory).
    /// The source moves to `error` with this message.
    #[error("adapter failure: {0}")]
    Adapter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl IngestError {
    pub fn adapter<S: Into<String>>(message: S) -> Self {
        Self::Adapter(message.into())
    }

    pub fn missing<S: Into<String>>(message: S) -> Self {
        Self::TransientIo(message.into())
    }

    /// Whether this error should park the source as `missing` rather
    /// than `error`.
    pub fn is_missing(&self) -> bool {
        match self {
            Self::TransientIo(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Reconstruction failure: no usable snapshot and no replayable edits.
#[derive(Debug, Error)]
#[error("file not reconstructible: {file_path}")]
pub struct NotReconstructible {
    pub file_path: String,
}

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::application::repos::RepoError;
use crate::domain::node::{NodeId, PayloadError};
use crate::domain::snapshot::GraftError;

/// Failures surfaced by the tree cache.
///
/// Readers never see these: `CacheState::snapshot` degrades to an empty tree.
/// Mutation entry points return them so an operator can retry.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("content source unavailable: {0}")]
    SourceUnavailable(#[source] RepoError),
    #[error("{op} timed out after {}ms", .after.as_millis())]
    Timeout { op: &'static str, after: Duration },
    #[error("snapshot file `{}` is corrupt: {reason}", .path.display())]
    DiskCorrupt { path: PathBuf, reason: String },
    #[error("failed to write snapshot file `{}`: {source}", .path.display())]
    DiskWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot file io error: {0}")]
    DiskIo(#[from] std::io::Error),
    #[error("node `{id}` has an invalid payload: {source}")]
    InvalidPayload {
        id: NodeId,
        #[source]
        source: PayloadError,
    },
    #[error(transparent)]
    InvalidGraft(#[from] GraftError),
}

impl CacheError {
    pub(crate) fn timeout(op: &'static str, after: Duration) -> Self {
        Self::Timeout { op, after }
    }

    pub(crate) fn disk_corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::DiskCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-friendly label for logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            CacheError::SourceUnavailable(_) => "source_unavailable",
            CacheError::Timeout { .. } => "timeout",
            CacheError::DiskCorrupt { .. } => "disk_corrupt",
            CacheError::DiskWriteFailed { .. } => "disk_write_failed",
            CacheError::DiskIo(_) => "disk_io",
            CacheError::InvalidPayload { .. } => "invalid_payload",
            CacheError::InvalidGraft(_) => "invalid_graft",
        }
    }
}

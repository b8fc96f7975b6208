//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::domain::node::{NodeId, SourceRow};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("database timeout")]
    Timeout,
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Read-only access to the relational source of published content.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Every published row, ordered by `(level, sort_order)`.
    fn stream_published_rows(&self) -> BoxStream<'_, Result<SourceRow, RepoError>>;

    /// The published row for `id`, or `None` when it is not (or no longer) published.
    async fn published_row(&self, id: NodeId) -> Result<Option<SourceRow>, RepoError>;
}

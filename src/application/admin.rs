use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::cache::{CacheError, CacheState, PublishOutcome, RefreshOutcome};
use crate::domain::node::NodeId;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("tree rebuild was vetoed by a lifecycle hook")]
    RefreshCancelled,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RepublishSummary {
    pub nodes: usize,
    pub orphans: usize,
    pub invalid: usize,
    pub vetoed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubtreeSummary {
    pub root_id: NodeId,
    pub published: Vec<NodeId>,
    pub skipped: Vec<NodeId>,
    /// Set when an unknown content type rebuilt the whole tree mid-way.
    pub rebuilt: bool,
}

/// Operator actions over the published tree.
#[derive(Clone)]
pub struct AdminService {
    cache: Arc<CacheState>,
}

impl AdminService {
    pub fn new(cache: Arc<CacheState>) -> Self {
        Self { cache }
    }

    /// Rebuild the whole tree from the content source.
    pub async fn republish_all(&self) -> Result<RepublishSummary, AdminError> {
        let report = match self.cache.refresh_all().await? {
            RefreshOutcome::Refreshed(report) => report,
            RefreshOutcome::Cancelled => return Err(AdminError::RefreshCancelled),
        };

        let nodes = self.cache.snapshot().await.len();
        info!(
            target = "verdant::application::admin",
            op = "republish_all",
            nodes,
            orphans = report.orphans.len(),
            "Republished everything"
        );
        Ok(RepublishSummary {
            nodes,
            orphans: report.orphans.len(),
            invalid: report.invalid.len(),
            vetoed: report.vetoed.len(),
        })
    }

    /// Re-publish `id` and every cached descendant, parents first.
    ///
    /// The subtree is read from one snapshot captured up front, so nodes that
    /// move in or out during the run are not chased.
    pub async fn republish_subtree(&self, id: NodeId) -> Result<SubtreeSummary, AdminError> {
        let snapshot = self.cache.snapshot().await;
        let mut targets = vec![id];
        targets.extend(snapshot.descendant_ids(id));
        drop(snapshot);

        let mut summary = SubtreeSummary {
            root_id: id,
            ..Default::default()
        };
        for target in targets {
            match self.cache.publish_node(target).await? {
                PublishOutcome::Published => summary.published.push(target),
                PublishOutcome::SchemaRefreshed => {
                    summary.rebuilt = true;
                    break;
                }
                _ => summary.skipped.push(target),
            }
        }

        info!(
            target = "verdant::application::admin",
            op = "republish_subtree",
            node_id = id,
            published = summary.published.len(),
            skipped = summary.skipped.len(),
            rebuilt = summary.rebuilt,
            "Republished subtree"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::domain::node::ROOT_ID;
    use crate::infra::memory::InMemorySource;

    fn service(source: Arc<InMemorySource>) -> AdminService {
        let config = CacheConfig {
            disk_cache_enabled: false,
            ..Default::default()
        };
        AdminService::new(Arc::new(CacheState::new(config, source)))
    }

    #[tokio::test]
    async fn republish_subtree_walks_parents_first() {
        let source = Arc::new(InMemorySource::new());
        source.upsert(1, ROOT_ID, 0, 1, "page");
        source.upsert(2, 1, 0, 2, "page");
        source.upsert(3, 2, 0, 3, "page");
        source.upsert(4, ROOT_ID, 1, 1, "page");
        let admin = service(source);

        let summary = admin.republish_subtree(1).await.expect("republish");
        assert_eq!(summary.published, vec![1, 2, 3]);
        assert!(summary.skipped.is_empty());
        assert!(!summary.rebuilt);
    }

    #[tokio::test]
    async fn republish_all_reports_tree_size() {
        let source = Arc::new(InMemorySource::new());
        source.upsert(1, ROOT_ID, 0, 1, "page");
        source.upsert(2, 1, 0, 2, "page");
        source.upsert(9, 404, 0, 2, "page");
        let admin = service(source);

        let summary = admin.republish_all().await.expect("republish");
        assert_eq!(summary.nodes, 2);
        assert_eq!(summary.orphans, 1);
    }

    #[tokio::test]
    async fn republish_subtree_skips_unpublished_nodes() {
        let source = Arc::new(InMemorySource::new());
        source.upsert(1, ROOT_ID, 0, 1, "page");
        source.upsert(2, 1, 0, 2, "page");
        let admin = service(source.clone());
        admin.cache.snapshot().await;

        source.remove(2);
        let summary = admin.republish_subtree(1).await.expect("republish");
        assert_eq!(summary.published, vec![1]);
        assert_eq!(summary.skipped, vec![2]);
    }
}

//! Builds trees from the relational source.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::application::repos::ContentSource;
use crate::domain::node::{Node, NodeId, SourceRow};
use crate::domain::snapshot::TreeSnapshot;

use super::error::CacheError;
use super::hooks::{HookOutcome, LifecycleHooks};

const METRIC_REBUILD_TOTAL: &str = "verdant_tree_rebuild_total";
const METRIC_REBUILD_MS: &str = "verdant_tree_rebuild_ms";
const METRIC_ORPHAN_ROWS: &str = "verdant_tree_orphan_rows_total";

/// What a full load produced besides the tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub rows: usize,
    /// Rows whose parent never made it into the tree.
    pub orphans: Vec<NodeId>,
    /// Rows with unparseable payloads.
    pub invalid: Vec<NodeId>,
    /// Rows vetoed by a node-load hook.
    pub vetoed: Vec<NodeId>,
}

#[derive(Debug)]
pub struct LoadedTree {
    pub snapshot: TreeSnapshot,
    pub report: LoadReport,
}

/// A node fetched for a single publish, after node-load hooks.
#[derive(Debug)]
pub enum FetchedNode {
    Ready {
        node: Node,
        keep_descendants: bool,
    },
    NotPublished,
    Vetoed,
}

pub struct SourceLoader {
    source: Arc<dyn ContentSource>,
    hooks: Arc<LifecycleHooks>,
    timeout: Duration,
    read_lock: Mutex<()>,
}

impl SourceLoader {
    pub fn new(source: Arc<dyn ContentSource>, hooks: Arc<LifecycleHooks>, timeout: Duration) -> Self {
        Self {
            source,
            hooks,
            timeout,
            read_lock: Mutex::new(()),
        }
    }

    /// Read every published row and assemble the full tree.
    ///
    /// Orphans and unusable rows are dropped; only a failing or timed out
    /// query fails the load.
    pub async fn load_full(&self) -> Result<LoadedTree, CacheError> {
        let _guard = self.read_lock.lock().await;
        let started_at = Instant::now();
        info!(target = "verdant::cache::loader", op = "load_full", "Loading published content from source");

        let rows: Vec<SourceRow> = tokio::time::timeout(
            self.timeout,
            self.source.stream_published_rows().try_collect::<Vec<_>>(),
        )
        .await
        .map_err(|_| CacheError::timeout("source.load_full", self.timeout))?
        .map_err(|err| {
            error!(
                target = "verdant::cache::loader",
                op = "load_full",
                result = "error",
                error = %err,
                "Failed to read published rows"
            );
            CacheError::SourceUnavailable(err)
        })?;

        let mut report = LoadReport {
            rows: rows.len(),
            ..Default::default()
        };
        let mut nodes = Vec::with_capacity(rows.len());
        let mut dropped_subtrees = Vec::new();

        for row in rows {
            let id = row.id;
            match self.prepare(row) {
                Prepared::Node(node, keep_descendants) => {
                    if !keep_descendants {
                        dropped_subtrees.push(id);
                    }
                    nodes.push(node);
                }
                Prepared::Vetoed => report.vetoed.push(id),
                Prepared::Invalid(reason) => {
                    warn!(
                        target = "verdant::cache::loader",
                        node_id = id,
                        error = %reason,
                        "Skipping row with invalid payload"
                    );
                    report.invalid.push(id);
                }
            }
        }

        // Descendants of a node whose hook cancelled them lose their parent link.
        if !dropped_subtrees.is_empty() {
            nodes.retain(|node| !dropped_subtrees.contains(&node.parent_id));
        }

        let assembled = TreeSnapshot::assemble(nodes);
        for orphan in &assembled.orphans {
            debug!(target = "verdant::cache::loader", node_id = orphan, "Dropping orphan row");
        }
        report.orphans = assembled.orphans;

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        counter!(METRIC_REBUILD_TOTAL).increment(1);
        counter!(METRIC_ORPHAN_ROWS).increment(report.orphans.len() as u64);
        histogram!(METRIC_REBUILD_MS).record(elapsed_ms as f64);
        info!(
            target = "verdant::cache::loader",
            op = "load_full",
            result = "ok",
            rows = report.rows,
            nodes = assembled.snapshot.len(),
            orphans = report.orphans.len(),
            invalid = report.invalid.len(),
            elapsed_ms,
            "Loaded published content from source"
        );

        Ok(LoadedTree {
            snapshot: assembled.snapshot,
            report,
        })
    }

    /// Fetch the canonical row for `id` and run it through node-load hooks.
    pub async fn fetch_node(&self, id: NodeId) -> Result<FetchedNode, CacheError> {
        let row = tokio::time::timeout(self.timeout, self.source.published_row(id))
            .await
            .map_err(|_| CacheError::timeout("source.published_row", self.timeout))?
            .map_err(CacheError::SourceUnavailable)?;

        let Some(row) = row else {
            return Ok(FetchedNode::NotPublished);
        };

        match self.prepare(row) {
            Prepared::Node(node, keep_descendants) => Ok(FetchedNode::Ready {
                node,
                keep_descendants,
            }),
            Prepared::Vetoed => Ok(FetchedNode::Vetoed),
            Prepared::Invalid(source) => Err(CacheError::InvalidPayload { id, source }),
        }
    }

    fn prepare(&self, mut row: SourceRow) -> Prepared {
        let before = self.hooks.before_node_load(&mut row);
        if before == HookOutcome::Cancel {
            return Prepared::Vetoed;
        }

        let mut node = match Node::from_row(&row) {
            Ok(node) => node,
            Err(err) => return Prepared::Invalid(err),
        };

        let after = self.hooks.after_node_load(&mut node);
        match before.merge(after) {
            HookOutcome::Cancel => Prepared::Vetoed,
            HookOutcome::CancelDescendants => Prepared::Node(node, false),
            HookOutcome::Proceed => Prepared::Node(node, true),
        }
    }
}

enum Prepared {
    Node(Node, bool),
    Vetoed,
    Invalid(crate::domain::node::PayloadError),
}

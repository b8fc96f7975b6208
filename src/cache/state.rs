//! The process-wide published tree.
//!
//! `CacheState` owns the one current snapshot pointer. Readers clone the `Arc`
//! and keep a consistent view for as long as they hold it. Every mutation
//! builds a new snapshot off to the side and swaps it in under the swap lock,
//! so readers never wait on a rebuild and never see a half-applied change.
//!
//! Lock order: swap lock, then the disk lock inside `DiskStore`. The pointer
//! lock is only ever held for a clone or a store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use crate::application::repos::ContentSource;
use crate::domain::node::{Node, NodeId};
use crate::domain::snapshot::{GraftError, TreeSnapshot};

use super::config::CacheConfig;
use super::disk::DiskStore;
use super::error::CacheError;
use super::hooks::{HookOutcome, LifecycleHooks};
use super::loader::{FetchedNode, LoadReport, SourceLoader};
use super::lock::{mutex_lock, mutex_try_lock, rw_read, rw_write};
use super::persist::{DiskWatermark, PersistenceScheduler};

const SOURCE: &str = "cache::state";

const METRIC_PUBLISH: &str = "verdant_publish_total";
const METRIC_UNPUBLISH: &str = "verdant_unpublish_total";
const METRIC_STALENESS_RELOAD: &str = "verdant_staleness_reload_total";
const METRIC_SNAPSHOT_NODES: &str = "verdant_snapshot_nodes";

/// Result of a single-node publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The source no longer reports the node as published; nothing changed.
    NotPublished,
    /// A hook vetoed the publish.
    Cancelled,
    /// The node brought a content type the tree never held; the whole tree was rebuilt.
    SchemaRefreshed,
    /// The node's parent is not in the tree; nothing changed.
    ParentMissing { parent_id: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpublishOutcome {
    /// The node and every id listed were removed.
    Unpublished { removed: Vec<NodeId> },
    NotPresent,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(LoadReport),
    Cancelled,
}

enum Step {
    Graft { next: TreeSnapshot, id: NodeId },
    Done(PublishOutcome),
    UnknownContentType(String),
}

pub struct CacheState {
    config: CacheConfig,
    loader: SourceLoader,
    disk: Arc<DiskStore>,
    watermark: Arc<DiskWatermark>,
    persistence: Arc<PersistenceScheduler>,
    hooks: Arc<LifecycleHooks>,
    current: RwLock<Option<Arc<TreeSnapshot>>>,
    populated: AtomicBool,
    swap_lock: tokio::sync::Mutex<()>,
    next_staleness_check: Mutex<Instant>,
    last_failure: Mutex<Option<String>>,
    empty: Arc<TreeSnapshot>,
}

impl CacheState {
    pub fn new(config: CacheConfig, source: Arc<dyn ContentSource>) -> Self {
        let hooks = Arc::new(LifecycleHooks::new());
        let disk = Arc::new(DiskStore::new(config.snapshot_path.clone(), config.disk_timeout));
        let watermark = Arc::new(DiskWatermark::new());
        let persistence = Arc::new(PersistenceScheduler::new(
            disk.clone(),
            watermark.clone(),
            config.writes_disk(),
        ));
        let loader = SourceLoader::new(source, hooks.clone(), config.source_timeout);

        Self {
            config,
            loader,
            disk,
            watermark,
            persistence,
            hooks,
            current: RwLock::new(None),
            populated: AtomicBool::new(false),
            swap_lock: tokio::sync::Mutex::new(()),
            next_staleness_check: Mutex::new(Instant::now()),
            last_failure: Mutex::new(None),
            empty: Arc::new(TreeSnapshot::empty()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<LifecycleHooks> {
        &self.hooks
    }

    pub fn persistence(&self) -> &Arc<PersistenceScheduler> {
        &self.persistence
    }

    /// True once any snapshot has been installed.
    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::SeqCst)
    }

    /// Message of the most recent load or rebuild failure.
    pub fn last_failure(&self) -> Option<String> {
        mutex_lock(&self.last_failure, SOURCE, "last_failure").clone()
    }

    /// The current snapshot.
    ///
    /// Returns the same `Arc` until the next mutation. Never fails: when neither
    /// disk nor source can produce a tree, an empty one is returned and the next
    /// call tries again.
    pub async fn snapshot(&self) -> Arc<TreeSnapshot> {
        self.check_staleness().await;
        if let Some(current) = self.current() {
            return current;
        }

        let _swap = self.swap_lock.lock().await;
        match self.ensure_loaded().await {
            Ok(snapshot) => snapshot,
            Err(_) => self.empty.clone(),
        }
    }

    /// Discard the tree and rebuild it from the source.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn refresh_all(&self) -> Result<RefreshOutcome, CacheError> {
        let swap = self.swap_lock.lock().await;
        let outcome = self.refresh_locked().await?;
        drop(swap);
        if let RefreshOutcome::Refreshed(_) = outcome {
            if let Some(snapshot) = self.current() {
                self.hooks.after_refresh(&snapshot);
            }
        }
        Ok(outcome)
    }

    /// Fetch `id` from the source and graft it into the tree, keeping its subtree.
    pub async fn publish_node(&self, id: NodeId) -> Result<PublishOutcome, CacheError> {
        let swap = self.swap_lock.lock().await;
        let current = self.ensure_loaded().await?;

        match self.prepare_publish(&current, id).await? {
            Step::Done(outcome) => {
                counter!(METRIC_PUBLISH, "result" => outcome_label(&outcome)).increment(1);
                Ok(outcome)
            }
            Step::UnknownContentType(content_type) => {
                drop(current);
                let refreshed = self.schema_refresh(id, &content_type).await?;
                drop(swap);
                if refreshed == RefreshOutcome::Cancelled {
                    counter!(METRIC_PUBLISH, "result" => "cancelled").increment(1);
                    return Ok(PublishOutcome::Cancelled);
                }
                if let Some(snapshot) = self.current() {
                    self.hooks.after_refresh(&snapshot);
                }
                counter!(METRIC_PUBLISH, "result" => "schema_refreshed").increment(1);
                Ok(PublishOutcome::SchemaRefreshed)
            }
            Step::Graft { next, id } => {
                let next = Arc::new(next);
                self.install(next.clone());
                self.persistence.mark_dirty(next.clone());
                drop(swap);

                counter!(METRIC_PUBLISH, "result" => "published").increment(1);
                info!(target = "verdant::cache::state", op = "publish", result = "ok", node_id = id, "Node published");
                if let Some(node) = next.get(id) {
                    self.hooks.after_publish(node);
                }
                Ok(PublishOutcome::Published)
            }
        }
    }

    /// Publish several nodes under one swap; readers see all or none of them.
    ///
    /// A node with an unknown content type rebuilds the whole tree and ends the
    /// batch, since the rebuild covers the rest.
    pub async fn publish_many(
        &self,
        ids: &[NodeId],
    ) -> Result<Vec<(NodeId, PublishOutcome)>, CacheError> {
        let swap = self.swap_lock.lock().await;
        let start = self.ensure_loaded().await?;
        let mut working: Arc<TreeSnapshot> = start.clone();
        let mut outcomes = Vec::with_capacity(ids.len());
        let mut published = Vec::new();

        for (index, &id) in ids.iter().enumerate() {
            match self.prepare_publish(&working, id).await? {
                Step::Done(outcome) => outcomes.push((id, outcome)),
                Step::Graft { next, id } => {
                    working = Arc::new(next);
                    published.push(id);
                    outcomes.push((id, PublishOutcome::Published));
                }
                Step::UnknownContentType(content_type) => {
                    if self.schema_refresh(id, &content_type).await? == RefreshOutcome::Cancelled {
                        outcomes.push((id, PublishOutcome::Cancelled));
                        continue;
                    }
                    drop(swap);
                    outcomes.extend(
                        ids[index..]
                            .iter()
                            .map(|&rest| (rest, PublishOutcome::SchemaRefreshed)),
                    );
                    if let Some(snapshot) = self.current() {
                        self.hooks.after_refresh(&snapshot);
                    }
                    return Ok(outcomes);
                }
            }
        }

        if !Arc::ptr_eq(&working, &start) {
            self.install(working.clone());
            self.persistence.mark_dirty(working.clone());
        }
        drop(swap);

        counter!(METRIC_PUBLISH, "result" => "published").increment(published.len() as u64);
        info!(
            target = "verdant::cache::state",
            op = "publish_many",
            result = "ok",
            requested = ids.len(),
            published = published.len(),
            "Batch published"
        );
        for id in published {
            if let Some(node) = working.get(id) {
                self.hooks.after_publish(node);
            }
        }
        Ok(outcomes)
    }

    /// Remove `id` and its subtree from the tree.
    pub async fn unpublish_node(&self, id: NodeId) -> Result<UnpublishOutcome, CacheError> {
        let swap = self.swap_lock.lock().await;
        let current = self.ensure_loaded().await?;
        if !current.contains(id) {
            debug!(target = "verdant::cache::state", op = "unpublish", node_id = id, "Node not in tree");
            return Ok(UnpublishOutcome::NotPresent);
        }

        // Descendants always leave with their parent, so only a full veto matters here.
        if self.hooks.before_unpublish(id) == HookOutcome::Cancel {
            info!(target = "verdant::cache::state", op = "unpublish", result = "cancelled", node_id = id, "Unpublish vetoed by hook");
            return Ok(UnpublishOutcome::Cancelled);
        }

        let Some((next, removed)) = current.prune(id) else {
            return Ok(UnpublishOutcome::NotPresent);
        };
        let next = Arc::new(next);
        self.install(next.clone());
        self.persistence.mark_dirty(next);
        drop(swap);

        counter!(METRIC_UNPUBLISH).increment(1);
        info!(
            target = "verdant::cache::state",
            op = "unpublish",
            result = "ok",
            node_id = id,
            removed = removed.len(),
            "Node unpublished"
        );
        self.hooks.after_unpublish(id, &removed);
        Ok(UnpublishOutcome::Unpublished { removed })
    }

    /// Change the cached sort order of `id`. Returns false when absent or unchanged.
    pub async fn update_sort_order(&self, id: NodeId, sort_order: i32) -> Result<bool, CacheError> {
        let _swap = self.swap_lock.lock().await;
        let current = self.ensure_loaded().await?;
        let Some(next) = current.with_sort_order(id, sort_order) else {
            return Ok(false);
        };
        let next = Arc::new(next);
        self.install(next.clone());
        self.persistence.mark_dirty(next);
        debug!(target = "verdant::cache::state", op = "update_sort_order", node_id = id, sort_order, "Sort order updated");
        Ok(true)
    }

    /// Re-sort the children of `parent_id`. Returns false when they already were sorted.
    pub async fn sort_children(&self, parent_id: NodeId) -> Result<bool, CacheError> {
        let _swap = self.swap_lock.lock().await;
        let current = self.ensure_loaded().await?;
        let Some(next) = current.with_sorted_children(parent_id) else {
            return Ok(false);
        };
        let next = Arc::new(next);
        self.install(next.clone());
        self.persistence.mark_dirty(next);
        Ok(true)
    }

    /// Write any pending snapshot now. Meant for shutdown.
    pub async fn flush(&self) -> Result<bool, CacheError> {
        self.persistence.flush().await
    }

    fn current(&self) -> Option<Arc<TreeSnapshot>> {
        rw_read(&self.current, SOURCE, "current").clone()
    }

    fn install(&self, snapshot: Arc<TreeSnapshot>) {
        gauge!(METRIC_SNAPSHOT_NODES).set(snapshot.len() as f64);
        *rw_write(&self.current, SOURCE, "install") = Some(snapshot);
        self.populated.store(true, Ordering::SeqCst);
    }

    fn record_failure(&self, err: &CacheError) {
        *mutex_lock(&self.last_failure, SOURCE, "record_failure") = Some(err.to_string());
    }

    /// Current snapshot, populating it first when needed. Caller holds the swap lock.
    async fn ensure_loaded(&self) -> Result<Arc<TreeSnapshot>, CacheError> {
        if let Some(current) = self.current() {
            return Ok(current);
        }

        if let Some(snapshot) = self.load_from_disk().await {
            let snapshot = Arc::new(snapshot);
            self.install(snapshot.clone());
            return Ok(snapshot);
        }

        match self.loader.load_full().await {
            Ok(loaded) => {
                let snapshot = Arc::new(loaded.snapshot);
                self.install(snapshot.clone());
                self.persistence.mark_dirty(snapshot.clone());
                Ok(snapshot)
            }
            Err(err) => {
                error!(
                    target = "verdant::cache::state",
                    op = "populate",
                    result = "error",
                    error = %err,
                    "Could not populate tree; serving empty tree"
                );
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    async fn load_from_disk(&self) -> Option<TreeSnapshot> {
        if !self.config.reads_disk() || !self.disk.exists().await {
            return None;
        }

        match self.disk.read().await {
            Ok(read) => {
                self.watermark.record(read.modified);
                info!(
                    target = "verdant::cache::state",
                    op = "populate",
                    result = "ok",
                    path = %self.disk.path().display(),
                    nodes = read.snapshot.len(),
                    "Tree loaded from snapshot file"
                );
                Some(read.snapshot)
            }
            Err(err) => {
                warn!(
                    target = "verdant::cache::state",
                    op = "populate",
                    result = "fallback",
                    path = %self.disk.path().display(),
                    error = %err,
                    "Snapshot file unusable; falling back to source"
                );
                self.record_failure(&err);
                self.discard_disk_file().await;
                None
            }
        }
    }

    async fn discard_disk_file(&self) {
        self.watermark.clear();
        if let Err(err) = self.disk.delete().await {
            warn!(
                target = "verdant::cache::state",
                op = "discard_disk_file",
                path = %self.disk.path().display(),
                error = %err,
                "Failed to remove snapshot file"
            );
        }
    }

    /// Rebuild from source and swap. Caller holds the swap lock and fires after-refresh.
    async fn refresh_locked(&self) -> Result<RefreshOutcome, CacheError> {
        // A refresh has no descendants to spare, so any veto cancels it.
        if self.hooks.before_refresh() != HookOutcome::Proceed {
            info!(target = "verdant::cache::state", op = "refresh_all", result = "cancelled", "Refresh vetoed by hook");
            return Ok(RefreshOutcome::Cancelled);
        }

        let loaded = match self.loader.load_full().await {
            Ok(loaded) => loaded,
            Err(err) => {
                error!(
                    target = "verdant::cache::state",
                    op = "refresh_all",
                    result = "error",
                    error = %err,
                    "Refresh failed; keeping previous tree"
                );
                self.record_failure(&err);
                return Err(err);
            }
        };

        let snapshot = Arc::new(loaded.snapshot);
        self.install(snapshot.clone());
        if self.config.reads_disk() {
            self.discard_disk_file().await;
        }
        self.persistence.mark_dirty(snapshot);
        Ok(RefreshOutcome::Refreshed(loaded.report))
    }

    async fn schema_refresh(
        &self,
        id: NodeId,
        content_type: &str,
    ) -> Result<RefreshOutcome, CacheError> {
        info!(
            target = "verdant::cache::state",
            op = "publish",
            result = "schema_mismatch",
            node_id = id,
            content_type,
            "Unknown content type; rebuilding whole tree"
        );
        self.refresh_locked().await
    }

    /// Work out what publishing `id` onto `base` means, without installing anything.
    async fn prepare_publish(&self, base: &TreeSnapshot, id: NodeId) -> Result<Step, CacheError> {
        let verdict = self.hooks.before_publish(id);
        if verdict == HookOutcome::Cancel {
            info!(target = "verdant::cache::state", op = "publish", result = "cancelled", node_id = id, "Publish vetoed by hook");
            return Ok(Step::Done(PublishOutcome::Cancelled));
        }

        let (node, keep_descendants): (Node, bool) = match self.loader.fetch_node(id).await? {
            FetchedNode::Ready {
                node,
                keep_descendants,
            } => (node, keep_descendants && verdict == HookOutcome::Proceed),
            FetchedNode::NotPublished => {
                info!(target = "verdant::cache::state", op = "publish", result = "not_published", node_id = id, "Source does not report node as published");
                return Ok(Step::Done(PublishOutcome::NotPublished));
            }
            FetchedNode::Vetoed => return Ok(Step::Done(PublishOutcome::Cancelled)),
        };

        if self.config.refresh_on_unknown_content_type
            && !base.is_empty()
            && !base.knows_content_type(node.content_type())
        {
            return Ok(Step::UnknownContentType(node.content_type().to_string()));
        }

        match base.graft(node, keep_descendants) {
            Ok(next) => Ok(Step::Graft { next, id }),
            Err(GraftError::ParentMissing { parent_id, .. }) => {
                warn!(
                    target = "verdant::cache::state",
                    op = "publish",
                    result = "parent_missing",
                    node_id = id,
                    parent_id,
                    "Parent not in tree; publish skipped"
                );
                Ok(Step::Done(PublishOutcome::ParentMissing { parent_id }))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Drop the in-memory tree when another process replaced the snapshot file.
    async fn check_staleness(&self) {
        if !self.config.watches_disk() || self.current().is_none() {
            return;
        }

        {
            let Some(mut next_check) =
                mutex_try_lock(&self.next_staleness_check, SOURCE, "check_staleness")
            else {
                return;
            };
            let now = Instant::now();
            if now < *next_check {
                return;
            }
            *next_check = now + self.config.staleness_check_interval;
        }

        let modified = match self.disk.modified_time().await {
            Ok(Some(modified)) => modified,
            Ok(None) => return,
            Err(err) => {
                debug!(target = "verdant::cache::state", op = "check_staleness", error = %err, "Snapshot file stat failed");
                return;
            }
        };

        if self.watermark.is_stale_against(modified) {
            counter!(METRIC_STALENESS_RELOAD).increment(1);
            info!(
                target = "verdant::cache::state",
                op = "check_staleness",
                result = "stale",
                path = %self.disk.path().display(),
                "Snapshot file changed on disk; dropping in-memory tree"
            );
            *rw_write(&self.current, SOURCE, "invalidate") = None;
        }
    }
}

fn outcome_label(outcome: &PublishOutcome) -> &'static str {
    match outcome {
        PublishOutcome::Published => "published",
        PublishOutcome::NotPublished => "not_published",
        PublishOutcome::Cancelled => "cancelled",
        PublishOutcome::SchemaRefreshed => "schema_refreshed",
        PublishOutcome::ParentMissing { .. } => "parent_missing",
    }
}

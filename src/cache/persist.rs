//! Deferred snapshot persistence.
//!
//! Mutations only mark the scheduler dirty. The snapshot reaches disk when a
//! unit of work ends (a request, a batch, a timer tick), so a burst of publishes
//! costs one write. At most one write is in flight; marks arriving during a
//! write are picked up by the same writer before it lets go.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::snapshot::TreeSnapshot;

use super::disk::DiskStore;
use super::error::CacheError;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::persist";

/// File time of the last snapshot file this process read or wrote.
///
/// A file newer than the watermark was written by someone else.
#[derive(Debug, Default)]
pub struct DiskWatermark {
    seen: Mutex<Option<SystemTime>>,
}

impl DiskWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, modified: SystemTime) {
        *mutex_lock(&self.seen, SOURCE, "watermark.record") = Some(modified);
    }

    pub fn clear(&self) {
        *mutex_lock(&self.seen, SOURCE, "watermark.clear") = None;
    }

    pub fn get(&self) -> Option<SystemTime> {
        *mutex_lock(&self.seen, SOURCE, "watermark.get")
    }

    /// Whether a file stamped `modified` is newer than anything this process has seen.
    pub fn is_stale_against(&self, modified: SystemTime) -> bool {
        match self.get() {
            Some(seen) => modified > seen,
            None => true,
        }
    }
}

struct Pending {
    snapshot: Arc<TreeSnapshot>,
    marked_at: SystemTime,
}

pub struct PersistenceScheduler {
    disk: Arc<DiskStore>,
    watermark: Arc<DiskWatermark>,
    enabled: bool,
    pending: Mutex<Option<Pending>>,
    writer: tokio::sync::Mutex<()>,
}

impl PersistenceScheduler {
    pub fn new(disk: Arc<DiskStore>, watermark: Arc<DiskWatermark>, enabled: bool) -> Self {
        Self {
            disk,
            watermark,
            enabled,
            pending: Mutex::new(None),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Remember `snapshot` as the one to write at the end of the current unit of work.
    pub fn mark_dirty(&self, snapshot: Arc<TreeSnapshot>) {
        if !self.enabled {
            return;
        }
        *mutex_lock(&self.pending, SOURCE, "mark_dirty") = Some(Pending {
            snapshot,
            marked_at: SystemTime::now(),
        });
    }

    pub fn is_dirty(&self) -> bool {
        mutex_lock(&self.pending, SOURCE, "is_dirty").is_some()
    }

    /// End-of-unit trigger. Returns immediately when another write is in flight;
    /// that writer drains whatever is pending. Returns whether a file was written.
    pub async fn end_of_unit(&self) -> Result<bool, CacheError> {
        let mut wrote = false;
        loop {
            let Ok(guard) = self.writer.try_lock() else {
                return Ok(wrote);
            };
            wrote |= self.drain().await?;
            drop(guard);

            // A mark that raced the guard release would otherwise wait for the next unit.
            if !self.is_dirty() {
                return Ok(wrote);
            }
        }
    }

    /// Wait for any in-flight write, then write whatever is pending.
    pub async fn flush(&self) -> Result<bool, CacheError> {
        let _guard = self.writer.lock().await;
        self.drain().await
    }

    /// Run `end_of_unit` every `period` for embeddings without a request boundary.
    pub fn spawn_interval(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = scheduler.end_of_unit().await {
                    warn!(
                        target = "verdant::cache::persist",
                        op = "interval_flush",
                        error = %err,
                        "Timed snapshot flush failed"
                    );
                }
            }
        })
    }

    async fn drain(&self) -> Result<bool, CacheError> {
        let mut wrote = false;
        while let Some(pending) = self.take() {
            let replaced_since = match self.disk.modified_time().await {
                Ok(Some(on_disk)) => {
                    on_disk >= pending.marked_at && self.watermark.is_stale_against(on_disk)
                }
                Ok(None) => false,
                Err(err) => {
                    self.restore(pending);
                    return Err(err);
                }
            };
            if replaced_since {
                debug!(
                    target = "verdant::cache::persist",
                    op = "drain",
                    result = "skipped",
                    "Snapshot file was replaced after this change; not overwriting"
                );
                continue;
            }

            match self.disk.write(&pending.snapshot).await {
                Ok(modified) => {
                    self.watermark.record(modified);
                    wrote = true;
                }
                Err(err) => {
                    self.restore(pending);
                    return Err(err);
                }
            }
        }
        Ok(wrote)
    }

    fn take(&self) -> Option<Pending> {
        mutex_lock(&self.pending, SOURCE, "take").take()
    }

    /// Put a failed write back unless a newer mark replaced it meanwhile.
    fn restore(&self, pending: Pending) {
        let mut slot = mutex_lock(&self.pending, SOURCE, "restore");
        if slot.is_none() {
            *slot = Some(pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{Node, Payload, ROOT_ID};

    fn snapshot(ids: &[i64]) -> Arc<TreeSnapshot> {
        let nodes = ids.iter().map(|&id| {
            Node::new(
                id,
                ROOT_ID,
                id as i32,
                1,
                Payload {
                    content_type: "page".to_string(),
                    attributes: Vec::new(),
                    data: serde_json::Value::Null,
                },
            )
        });
        Arc::new(TreeSnapshot::assemble(nodes).snapshot)
    }

    fn scheduler(dir: &tempfile::TempDir, enabled: bool) -> (Arc<PersistenceScheduler>, Arc<DiskStore>) {
        let disk = Arc::new(DiskStore::new(
            dir.path().join("published.json"),
            Duration::from_secs(5),
        ));
        let scheduler = Arc::new(PersistenceScheduler::new(
            disk.clone(),
            Arc::new(DiskWatermark::new()),
            enabled,
        ));
        (scheduler, disk)
    }

    #[tokio::test]
    async fn burst_of_marks_costs_one_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, disk) = scheduler(&dir, true);

        scheduler.mark_dirty(snapshot(&[1]));
        scheduler.mark_dirty(snapshot(&[1, 2]));
        scheduler.mark_dirty(snapshot(&[1, 2, 3]));

        assert!(scheduler.end_of_unit().await.expect("flush"));
        assert!(!scheduler.is_dirty());
        assert_eq!(disk.read().await.expect("read").snapshot.len(), 3);

        assert!(!scheduler.end_of_unit().await.expect("clean unit"));
    }

    #[tokio::test]
    async fn disabled_scheduler_never_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, disk) = scheduler(&dir, false);

        scheduler.mark_dirty(snapshot(&[1]));
        assert!(!scheduler.is_dirty());
        assert!(!scheduler.flush().await.expect("flush"));
        assert!(!disk.exists().await);
    }

    #[tokio::test]
    async fn own_writes_do_not_look_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let disk = Arc::new(DiskStore::new(
            dir.path().join("published.json"),
            Duration::from_secs(5),
        ));
        let watermark = Arc::new(DiskWatermark::new());
        let scheduler = PersistenceScheduler::new(disk.clone(), watermark.clone(), true);

        scheduler.mark_dirty(snapshot(&[1]));
        scheduler.flush().await.expect("flush");

        let on_disk = disk.modified_time().await.expect("stat").expect("file");
        assert!(!watermark.is_stale_against(on_disk));
    }

    #[tokio::test]
    async fn failed_write_stays_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("published.json");
        std::fs::create_dir_all(path.join("occupied")).expect("squat");
        let disk = Arc::new(DiskStore::new(&path, Duration::from_secs(5)));
        let scheduler = PersistenceScheduler::new(disk, Arc::new(DiskWatermark::new()), true);

        scheduler.mark_dirty(snapshot(&[1]));
        assert!(scheduler.flush().await.is_err());
        assert!(scheduler.is_dirty());
    }

    #[tokio::test]
    async fn unreadable_file_state_keeps_change_for_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A regular file where the parent directory should be makes the stat fail.
        let blocker = dir.path().join("data");
        std::fs::write(&blocker, b"").expect("blocker");
        let path = blocker.join("published.json");
        let disk = Arc::new(DiskStore::new(&path, Duration::from_secs(5)));
        let scheduler = PersistenceScheduler::new(disk, Arc::new(DiskWatermark::new()), true);

        scheduler.mark_dirty(snapshot(&[1, 2]));
        assert!(scheduler.flush().await.is_err());
        assert!(scheduler.is_dirty());

        std::fs::remove_file(&blocker).expect("unblock");
        assert!(scheduler.flush().await.expect("retry"));
        assert!(path.exists());
        assert!(!scheduler.is_dirty());
    }
}

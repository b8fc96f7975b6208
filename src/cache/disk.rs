//! Snapshot file on local disk.
//!
//! The file holds the whole tree as JSON, nodes in pre-order. Writes go to a
//! sibling temp file that is renamed over the target, so a concurrent reader in
//! another process sees either the old or the new file, never a torn one.
//! Reads and writes inside this process are serialized by the disk lock.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, SystemTime};

use metrics::counter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::node::{Node, NodeId, Payload};
use crate::domain::snapshot::TreeSnapshot;

use super::error::CacheError;

const FORMAT_VERSION: u32 = 1;

const WRITE_RUNNING: u8 = 0;
const WRITE_DONE: u8 = 1;
const WRITE_ABANDONED: u8 = 2;

const METRIC_DISK_READ: &str = "verdant_disk_read_total";
const METRIC_DISK_WRITE: &str = "verdant_disk_write_total";
const METRIC_DISK_FAILURE: &str = "verdant_disk_failure_total";

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    format_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    written_at: OffsetDateTime,
    nodes: Vec<NodeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    id: NodeId,
    parent_id: NodeId,
    sort_order: i32,
    level: i32,
    payload: Payload,
}

impl From<&Node> for NodeRecord {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id,
            parent_id: node.parent_id,
            sort_order: node.sort_order,
            level: node.level,
            payload: node.payload.clone(),
        }
    }
}

impl From<NodeRecord> for Node {
    fn from(record: NodeRecord) -> Self {
        Node::new(
            record.id,
            record.parent_id,
            record.sort_order,
            record.level,
            record.payload,
        )
    }
}

/// A snapshot read back from disk with the file time it was read at.
#[derive(Debug)]
pub struct DiskRead {
    pub snapshot: TreeSnapshot,
    pub modified: SystemTime,
}

pub struct DiskStore {
    path: PathBuf,
    timeout: Duration,
    lock: Arc<Mutex<()>>,
}

impl DiskStore {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `snapshot` over the snapshot file and return the new file time.
    ///
    /// Any failure removes the file so the next cold start rebuilds from source.
    pub async fn write(&self, snapshot: &TreeSnapshot) -> Result<SystemTime, CacheError> {
        let document = SnapshotDocument {
            format_version: FORMAT_VERSION,
            written_at: OffsetDateTime::now_utc(),
            nodes: snapshot.preorder().into_iter().map(NodeRecord::from).collect(),
        };
        let bytes = serde_json::to_vec(&document).map_err(|err| CacheError::DiskWriteFailed {
            path: self.path.clone(),
            source: std::io::Error::other(err),
        })?;

        // The blocking job owns the disk lock, so an abandoned write still
        // finishes (or cleans up) before anyone else touches the file.
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let path = self.path.clone();
        let state = Arc::new(AtomicU8::new(WRITE_RUNNING));
        let job_state = Arc::clone(&state);
        let mut job = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let written = replace_file(&path, &bytes, &job_state);
            let settled = job_state
                .compare_exchange(WRITE_RUNNING, WRITE_DONE, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            match (written, settled) {
                (Ok(modified), true) => Ok(modified),
                (Ok(_), false) => {
                    remove_blocking(&path);
                    Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "write abandoned after timeout",
                    ))
                }
                (Err(err), _) => {
                    remove_blocking(&path);
                    Err(err)
                }
            }
        });

        let result = match tokio::time::timeout(self.timeout, &mut job).await {
            Ok(joined) => self.settle_write(joined).await,
            Err(_) => {
                let abandoned = state
                    .compare_exchange(
                        WRITE_RUNNING,
                        WRITE_ABANDONED,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok();
                if abandoned {
                    Err(CacheError::timeout("disk.write", self.timeout))
                } else {
                    // Finished between the deadline and the flag; its outcome stands.
                    self.settle_write(job.await).await
                }
            }
        };

        match result {
            Ok(modified) => {
                counter!(METRIC_DISK_WRITE).increment(1);
                info!(
                    target = "verdant::cache::disk",
                    op = "write",
                    result = "ok",
                    path = %self.path.display(),
                    nodes = snapshot.len(),
                    "Snapshot file written"
                );
                Ok(modified)
            }
            Err(err) => {
                counter!(METRIC_DISK_FAILURE, "kind" => "write").increment(1);
                warn!(
                    target = "verdant::cache::disk",
                    op = "write",
                    result = "error",
                    path = %self.path.display(),
                    error = %err,
                    "Snapshot write failed"
                );
                Err(err)
            }
        }
    }

    async fn settle_write(
        &self,
        joined: Result<std::io::Result<SystemTime>, tokio::task::JoinError>,
    ) -> Result<SystemTime, CacheError> {
        match joined {
            Ok(Ok(modified)) => Ok(modified),
            Ok(Err(source)) => Err(CacheError::DiskWriteFailed {
                path: self.path.clone(),
                source,
            }),
            Err(join) => {
                // The job died before its own cleanup ran.
                let _guard = self.lock.lock().await;
                remove_quietly(&self.path).await;
                Err(CacheError::DiskWriteFailed {
                    path: self.path.clone(),
                    source: std::io::Error::other(join),
                })
            }
        }
    }

    /// Read and rebuild the snapshot. Errors go to the caller, which decides the fallback.
    pub async fn read(&self) -> Result<DiskRead, CacheError> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();

        let (modified, bytes) = tokio::time::timeout(self.timeout, async {
            let modified = tokio::fs::metadata(&path).await?.modified()?;
            let bytes = tokio::fs::read(&path).await?;
            Ok::<_, std::io::Error>((modified, bytes))
        })
        .await
        .map_err(|_| CacheError::timeout("disk.read", self.timeout))??;

        let document: SnapshotDocument = serde_json::from_slice(&bytes).map_err(|err| {
            counter!(METRIC_DISK_FAILURE, "kind" => "corrupt").increment(1);
            CacheError::disk_corrupt(&self.path, err)
        })?;
        if document.format_version != FORMAT_VERSION {
            counter!(METRIC_DISK_FAILURE, "kind" => "corrupt").increment(1);
            return Err(CacheError::disk_corrupt(
                &self.path,
                format!("unsupported format version {}", document.format_version),
            ));
        }

        let record_count = document.nodes.len();
        let assembled = TreeSnapshot::assemble(document.nodes.into_iter().map(Node::from));
        if !assembled.orphans.is_empty() {
            counter!(METRIC_DISK_FAILURE, "kind" => "corrupt").increment(1);
            return Err(CacheError::disk_corrupt(
                &self.path,
                format!("{} of {record_count} nodes are detached", assembled.orphans.len()),
            ));
        }

        counter!(METRIC_DISK_READ).increment(1);
        debug!(
            target = "verdant::cache::disk",
            op = "read",
            result = "ok",
            path = %self.path.display(),
            nodes = assembled.snapshot.len(),
            written_at = %document.written_at,
            "Snapshot file read"
        );
        Ok(DiskRead {
            snapshot: assembled.snapshot,
            modified,
        })
    }

    /// File time of the snapshot file, `None` when it does not exist.
    pub async fn modified_time(&self) -> Result<Option<SystemTime>, CacheError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => Ok(Some(metadata.modified()?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// True when the file exists and is non-empty.
    pub async fn exists(&self) -> bool {
        tokio::fs::metadata(&self.path)
            .await
            .map(|metadata| metadata.is_file() && metadata.len() > 0)
            .unwrap_or(false)
    }

    /// Remove the snapshot file. Returns whether one was removed.
    pub async fn delete(&self) -> Result<bool, CacheError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(target = "verdant::cache::disk", op = "delete", path = %self.path.display(), "Snapshot file removed");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

fn replace_file(path: &Path, bytes: &[u8], state: &AtomicU8) -> std::io::Result<SystemTime> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    if state.load(Ordering::SeqCst) == WRITE_ABANDONED {
        return Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write abandoned after timeout",
        ));
    }
    let file = temp.persist(path).map_err(|err| err.error)?;
    file.metadata()?.modified()
}

fn remove_blocking(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            target = "verdant::cache::disk",
            op = "delete",
            path = %path.display(),
            error = %err,
            "Failed to remove snapshot file"
        ),
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            target = "verdant::cache::disk",
            op = "delete",
            path = %path.display(),
            error = %err,
            "Failed to remove snapshot file"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::ROOT_ID;
    use serde_json::json;

    fn node(id: NodeId, parent_id: NodeId, sort_order: i32, content_type: &str) -> Node {
        Node::new(
            id,
            parent_id,
            sort_order,
            0,
            Payload {
                content_type: content_type.to_string(),
                attributes: vec![("title".to_string(), format!("node {id}"))],
                data: json!({ "body": id }),
            },
        )
    }

    fn sample() -> TreeSnapshot {
        TreeSnapshot::assemble(vec![
            node(1, ROOT_ID, 0, "home"),
            node(2, 1, 0, "page"),
            node(3, 1, 10, "page"),
            node(4, 3, 0, "article"),
        ])
        .snapshot
    }

    fn store(dir: &tempfile::TempDir) -> DiskStore {
        DiskStore::new(dir.path().join("nested").join("published.json"), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn write_then_read_returns_equal_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let snapshot = sample();

        let written = store.write(&snapshot).await.expect("write");
        let read = store.read().await.expect("read");

        assert_eq!(read.snapshot, snapshot);
        assert_eq!(read.modified, written);
        assert_eq!(store.modified_time().await.expect("stat"), Some(written));
    }

    #[tokio::test]
    async fn garbage_file_is_reported_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        std::fs::write(store.path(), b"{ not a snapshot").expect("seed");

        let err = store.read().await.expect_err("corrupt");
        assert!(matches!(err, CacheError::DiskCorrupt { .. }));
    }

    #[tokio::test]
    async fn exists_requires_non_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        assert!(!store.exists().await);

        std::fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        std::fs::write(store.path(), b"").expect("seed");
        assert!(!store.exists().await);

        store.write(&sample()).await.expect("write");
        assert!(store.exists().await);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.write(&sample()).await.expect("write");

        assert!(store.delete().await.expect("delete"));
        assert!(!store.delete().await.expect("delete again"));
        assert_eq!(store.modified_time().await.expect("stat"), None);
    }

    fn wide(count: NodeId) -> TreeSnapshot {
        TreeSnapshot::assemble((1..=count).map(|id| node(id, ROOT_ID, id as i32, "page"))).snapshot
    }

    #[tokio::test]
    async fn timed_out_write_leaves_no_file_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("published.json");
        let store = DiskStore::new(&path, Duration::ZERO);

        let err = store.write(&wide(50_000)).await.expect_err("deadline");
        assert!(matches!(err, CacheError::Timeout { .. }));

        // Reading waits on the disk lock, which the abandoned job holds until it is done.
        assert!(store.read().await.is_err());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!path.exists());
        assert_eq!(store.modified_time().await.expect("stat"), None);
    }

    #[tokio::test]
    async fn failed_write_removes_previous_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("published.json");
        DiskStore::new(&path, Duration::from_secs(5))
            .write(&sample())
            .await
            .expect("seed");
        assert!(path.exists());

        let hasty = DiskStore::new(&path, Duration::ZERO);
        hasty.write(&wide(50_000)).await.expect_err("deadline");

        assert!(hasty.read().await.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_write_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A directory squatting on the target path makes the rename fail.
        let path = dir.path().join("published.json");
        std::fs::create_dir_all(path.join("occupied")).expect("squat");
        let store = DiskStore::new(&path, Duration::from_secs(5));

        let err = store.write(&sample()).await.expect_err("write should fail");
        assert!(matches!(err, CacheError::DiskWriteFailed { .. }));
    }
}

//! In-process content source for embedding and tests.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use serde_json::Value;

use crate::application::repos::{ContentSource, RepoError};
use crate::cache::lock::{rw_read, rw_write};
use crate::domain::node::{NodeId, Payload, SourceRow};

const SOURCE: &str = "infra::memory";

/// Published rows held in memory, with switches for simulating outages and slow queries.
#[derive(Default)]
pub struct InMemorySource {
    rows: RwLock<BTreeMap<NodeId, SourceRow>>,
    unavailable: AtomicBool,
    latency_ms: AtomicUsize,
    full_queries: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a row whose payload only carries a content type.
    pub fn upsert(&self, id: NodeId, parent_id: NodeId, sort_order: i32, level: i32, content_type: &str) {
        let payload = Payload {
            content_type: content_type.to_string(),
            attributes: Vec::new(),
            data: Value::Null,
        };
        self.upsert_payload(id, parent_id, sort_order, level, &payload);
    }

    pub fn upsert_payload(
        &self,
        id: NodeId,
        parent_id: NodeId,
        sort_order: i32,
        level: i32,
        payload: &Payload,
    ) {
        let raw = serde_json::to_string(payload).unwrap_or_default();
        self.upsert_raw(id, parent_id, sort_order, level, &raw);
    }

    pub fn upsert_raw(&self, id: NodeId, parent_id: NodeId, sort_order: i32, level: i32, raw: &str) {
        rw_write(&self.rows, SOURCE, "upsert").insert(
            id,
            SourceRow {
                id,
                parent_id,
                sort_order,
                level,
                raw_payload: raw.to_string(),
            },
        );
    }

    /// Unpublish a row. Returns whether it existed.
    pub fn remove(&self, id: NodeId) -> bool {
        rw_write(&self.rows, SOURCE, "remove").remove(&id).is_some()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as usize, Ordering::SeqCst);
    }

    /// How many full-table queries have been issued.
    pub fn full_query_count(&self) -> usize {
        self.full_queries.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.rows, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::SeqCst) as u64)
    }

    fn check_available(&self) -> Result<(), RepoError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable("in-memory source switched off".to_string()));
        }
        Ok(())
    }
}

async fn pause(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

#[async_trait]
impl ContentSource for InMemorySource {
    fn stream_published_rows(&self) -> BoxStream<'_, Result<SourceRow, RepoError>> {
        self.full_queries.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency();
        let result = self.check_available().map(|()| {
            let mut rows: Vec<SourceRow> = rw_read(&self.rows, SOURCE, "stream")
                .values()
                .cloned()
                .collect();
            rows.sort_by_key(|row| (row.level, row.sort_order));
            rows
        });

        futures::stream::once(async move {
            pause(latency).await;
            result
        })
        .map_ok(|rows| futures::stream::iter(rows.into_iter().map(Ok::<_, RepoError>)))
        .try_flatten()
        .boxed()
    }

    async fn published_row(&self, id: NodeId) -> Result<Option<SourceRow>, RepoError> {
        pause(self.latency()).await;
        self.check_available()?;
        Ok(rw_read(&self.rows, SOURCE, "published_row").get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::ROOT_ID;

    #[tokio::test]
    async fn rows_stream_in_level_then_sort_order() {
        let source = InMemorySource::new();
        source.upsert(3, 1, 5, 2, "page");
        source.upsert(2, 1, 1, 2, "page");
        source.upsert(1, ROOT_ID, 0, 1, "home");

        let rows: Vec<SourceRow> = source
            .stream_published_rows()
            .try_collect()
            .await
            .expect("rows");
        let ids: Vec<NodeId> = rows.iter().map(|row| row.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(source.full_query_count(), 1);
    }

    #[tokio::test]
    async fn outage_fails_both_queries() {
        let source = InMemorySource::new();
        source.upsert(1, ROOT_ID, 0, 1, "home");
        source.set_available(false);

        let result: Result<Vec<SourceRow>, RepoError> =
            source.stream_published_rows().try_collect().await;
        assert!(result.is_err());
        assert!(source.published_row(1).await.is_err());
    }
}

//! Postgres-backed content source.

mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    query_as,
};

use crate::application::repos::{ContentSource, RepoError};
use crate::domain::node::{NodeId, SourceRow};

const PUBLISHED_ROWS_SQL: &str = r#"
    SELECT n.id, n.parent_id, n.sort_order, n.level, p.payload::text AS raw_payload
    FROM content_nodes n
    INNER JOIN content_payloads p ON p.node_id = n.id
    WHERE n.published
    ORDER BY n.level, n.sort_order, n.id
"#;

const PUBLISHED_ROW_SQL: &str = r#"
    SELECT n.id, n.parent_id, n.sort_order, n.level, p.payload::text AS raw_payload
    FROM content_nodes n
    INNER JOIN content_payloads p ON p.node_id = n.id
    WHERE n.published AND n.id = $1
"#;

#[derive(sqlx::FromRow)]
struct PublishedRow {
    id: i64,
    parent_id: i64,
    sort_order: i32,
    level: i32,
    raw_payload: String,
}

impl From<PublishedRow> for SourceRow {
    fn from(row: PublishedRow) -> Self {
        Self {
            id: row.id,
            parent_id: row.parent_id,
            sort_order: row.sort_order,
            level: row.level,
            raw_payload: row.raw_payload,
        }
    }
}

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl ContentSource for PostgresRepositories {
    fn stream_published_rows(&self) -> BoxStream<'_, Result<SourceRow, RepoError>> {
        let stream = query_as::<_, PublishedRow>(PUBLISHED_ROWS_SQL)
            .fetch(self.pool())
            .map(|row| match row {
                Ok(row) => Ok(SourceRow::from(row)),
                Err(err) => Err(map_sqlx_error(err)),
            });

        Box::pin(stream)
    }

    async fn published_row(&self, id: NodeId) -> Result<Option<SourceRow>, RepoError> {
        query_as::<_, PublishedRow>(PUBLISHED_ROW_SQL)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map(|row| row.map(SourceRow::from))
            .map_err(map_sqlx_error)
    }
}

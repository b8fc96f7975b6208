//! Request-scoped persistence.
//!
//! Treats one HTTP request as the unit of work: whatever the request changed
//! is written to the snapshot file once, after the response is produced.

use std::sync::Arc;

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use tracing::{instrument, warn};

use super::persist::PersistenceScheduler;
use super::state::CacheState;

/// Middleware that flushes pending snapshot changes at the end of each request.
///
/// The write runs on a spawned task so the response is not held back by disk I/O.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn persist_after_request(
    State(cache): State<Arc<CacheState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let response = next.run(request).await;

    let scheduler = cache.persistence();
    if scheduler.is_dirty() {
        spawn_end_of_unit(Arc::clone(scheduler));
    }

    response
}

fn spawn_end_of_unit(scheduler: Arc<PersistenceScheduler>) {
    tokio::spawn(async move {
        if let Err(err) = scheduler.end_of_unit().await {
            warn!(
                target = "verdant::cache::persist",
                op = "end_of_request",
                error = %err,
                "Snapshot flush after request failed"
            );
        }
    });
}

//! Read-only tree API plus the two administrative republish actions.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value;

use crate::application::admin::{AdminService, RepublishSummary, SubtreeSummary};
use crate::application::error::AppError;
use crate::cache::{CacheState, persist_after_request};
use crate::domain::node::{Node, NodeId};
use crate::domain::snapshot::TreeNavigation;

#[derive(Clone)]
pub struct HttpState {
    pub cache: Arc<CacheState>,
    pub admin: AdminService,
}

impl HttpState {
    pub fn new(cache: Arc<CacheState>) -> Self {
        let admin = AdminService::new(cache.clone());
        Self { cache, admin }
    }
}

pub fn build_router(state: HttpState) -> Router {
    let cache = state.cache.clone();
    Router::new()
        .route("/health", get(health))
        .route("/nodes", get(root_nodes))
        .route("/nodes/{id}", get(node_by_id))
        .route("/nodes/{id}/children", get(node_children))
        .route("/admin/republish", post(republish_all))
        .route("/admin/republish/{id}", post(republish_subtree))
        .layer(middleware::from_fn_with_state(cache, persist_after_request))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub sort_order: i32,
    pub level: i32,
    pub content_type: String,
    pub attributes: Vec<(String, String)>,
    pub data: Value,
    pub children: Vec<NodeId>,
}

impl From<&Node> for NodeView {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id,
            parent_id: node.parent_id,
            sort_order: node.sort_order,
            level: node.level,
            content_type: node.payload.content_type.clone(),
            attributes: node.payload.attributes.clone(),
            data: node.payload.data.clone(),
            children: node.children().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthView {
    populated: bool,
    nodes: usize,
    last_failure: Option<String>,
}

async fn health(State(state): State<HttpState>) -> Response {
    let snapshot = state.cache.snapshot().await;
    let view = HealthView {
        populated: state.cache.is_populated(),
        nodes: snapshot.len(),
        last_failure: state.cache.last_failure(),
    };
    let status = if view.populated {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(view)).into_response()
}

async fn root_nodes(State(state): State<HttpState>) -> Json<Vec<NodeView>> {
    let snapshot = state.cache.snapshot().await;
    Json(
        snapshot
            .get_root()
            .into_iter()
            .map(NodeView::from)
            .collect(),
    )
}

async fn node_by_id(
    State(state): State<HttpState>,
    Path(id): Path<NodeId>,
) -> Result<Json<NodeView>, AppError> {
    let snapshot = state.cache.snapshot().await;
    snapshot
        .get_by_id(id)
        .map(|node| Json(NodeView::from(node)))
        .ok_or(AppError::NotFound)
}

async fn node_children(
    State(state): State<HttpState>,
    Path(id): Path<NodeId>,
) -> Result<Json<Vec<NodeView>>, AppError> {
    let snapshot = state.cache.snapshot().await;
    if !snapshot.contains(id) {
        return Err(AppError::NotFound);
    }
    Ok(Json(
        snapshot
            .get_children(id)
            .into_iter()
            .map(NodeView::from)
            .collect(),
    ))
}

async fn republish_all(
    State(state): State<HttpState>,
) -> Result<Json<RepublishSummary>, AppError> {
    Ok(Json(state.admin.republish_all().await?))
}

async fn republish_subtree(
    State(state): State<HttpState>,
    Path(id): Path<NodeId>,
) -> Result<Json<SubtreeSummary>, AppError> {
    Ok(Json(state.admin.republish_subtree(id).await?))
}

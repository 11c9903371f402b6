use crate::bucket::Level;
use crate::storage::traits::{
    Job, JobStore, PendingCounts, ReadingStore, Rollup, RollupStore, Storage, StorageError, Tag,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Shared state for the status API
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub stuck_after: Duration,
}

#[derive(Debug, Serialize)]
pub struct PendingJobsResponse {
    pub counts: PendingCounts,
    pub total: u64,
    /// Pending jobs older than the configured threshold.
    pub stuck: Vec<Job>,
}

#[derive(Debug, Deserialize)]
pub struct PendingJobsQuery {
    #[serde(default = "default_stuck_limit")]
    pub limit: usize,
}

fn default_stuck_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct RollupsQuery {
    pub tag: String,
    pub level: String,
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RollupsResponse {
    pub tag: Tag,
    pub level: String,
    pub rollups: Vec<Rollup>,
}

pub async fn health_check() -> &'static str {
    "OK"
}

/// GET /api/jobs/pending?limit=N
pub async fn pending_jobs(
    State(state): State<AppState>,
    Query(query): Query<PendingJobsQuery>,
) -> Result<Json<PendingJobsResponse>, ApiError> {
    let counts = state.storage.pending_counts().await?;

    let stuck_after = chrono::Duration::from_std(state.stuck_after)
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    let limit = query.limit.clamp(1, 1000);
    let stuck = state.storage.stuck_jobs(Utc::now() - stuck_after, limit).await?;

    Ok(Json(PendingJobsResponse {
        total: counts.total(),
        counts,
        stuck,
    }))
}

/// GET /api/tags
pub async fn list_tags(State(state): State<AppState>) -> Result<Json<Vec<Tag>>, ApiError> {
    Ok(Json(state.storage.list_tags().await?))
}

/// GET /api/rollups?tag=NAME&level=day&from=TS&to=TS
///
/// `from` and `to` bound bucket keys as `[from, to)`; both default to open.
pub async fn list_rollups(
    State(state): State<AppState>,
    Query(query): Query<RollupsQuery>,
) -> Result<Json<RollupsResponse>, ApiError> {
    let level: Level = query
        .level
        .parse()
        .map_err(|e: crate::bucket::UnknownLevel| ApiError::BadRequest(e.to_string()))?;

    let tag = state
        .storage
        .get_tag_by_name(&query.tag)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown tag '{}'", query.tag)))?;

    let from = query.from.unwrap_or(i64::MIN);
    let to = query.to.unwrap_or(i64::MAX);
    if from >= to {
        return Err(ApiError::BadRequest("'from' must be before 'to'".to_string()));
    }

    let rollups = state.storage.rollups_in_range(tag.id, level, from, to).await?;
    Ok(Json(RollupsResponse {
        tag,
        level: level.to_string(),
        rollups,
    }))
}

// Error handling
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalError(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::InternalError(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

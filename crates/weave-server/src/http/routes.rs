use super::{AppError, AppResult, AppState, JsonResponse};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;
use weave_core::{
    CascadeReport, EdgeUpdate, EpisodeInput, EpisodeKind, JobStatus, SearchKind, SearchRequest,
    SearchResults, StoreStats, WeaveError,
};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/episodes", post(ingest_episode))
        .route("/episodes/:id", delete(delete_episode))
        .route("/episodes/:id/status", get(episode_status))
        .route("/search", post(search))
        .route("/edges/:id", post(update_edge))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    version: String,
    uptime_seconds: u64,
}

/// Liveness only; deliberately does not probe the LLM provider.
async fn health(State(state): State<AppState>) -> Json<JsonResponse<HealthResponse>> {
    Json(JsonResponse::ok(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    }))
}

async fn stats(State(state): State<AppState>) -> AppResult<Json<JsonResponse<StoreStats>>> {
    Ok(Json(JsonResponse::ok(state.weave.stats().await?)))
}

#[derive(Deserialize)]
struct IngestBody {
    name: String,
    content: String,
    group_id: Option<String>,
    kind: Option<String>,
    source_description: Option<String>,
    source_url: Option<String>,
    id: Option<Uuid>,
    reference_time: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct IngestResponse {
    status: &'static str,
    episode_id: Uuid,
    name: String,
    group_id: String,
}

async fn ingest_episode(
    State(state): State<AppState>,
    Json(body): Json<IngestBody>,
) -> AppResult<impl IntoResponse> {
    let kind = match body.kind.as_deref() {
        None => None,
        Some(raw) => Some(EpisodeKind::parse(raw).ok_or_else(|| {
            AppError(WeaveError::Validation(format!(
                "Unknown episode kind '{}'",
                raw
            )))
        })?),
    };

    let ack = state
        .weave
        .ingest(EpisodeInput {
            name: body.name,
            content: body.content,
            group_id: body.group_id,
            kind,
            source_description: body.source_description,
            source_url: body.source_url,
            id: body.id,
            reference_time: body.reference_time,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(JsonResponse::ok(IngestResponse {
            status: "accepted",
            episode_id: ack.episode_id,
            name: ack.name,
            group_id: ack.group_id,
        })),
    ))
}

#[derive(Deserialize)]
struct SearchBody {
    query: Option<String>,
    kind: String,
    max_results: Option<usize>,
    group_ids: Option<Vec<String>>,
    labels: Option<Vec<String>>,
    center_node_id: Option<Uuid>,
    include_expired: Option<bool>,
}

#[derive(Serialize)]
struct SearchResponse {
    kind: SearchKind,
    count: usize,
    results: SearchResults,
}

async fn search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> AppResult<Json<JsonResponse<SearchResponse>>> {
    let kind = match body.kind.as_str() {
        "edges" => SearchKind::Edges,
        "nodes" => SearchKind::Nodes,
        "episodes" => SearchKind::Episodes,
        other => {
            return Err(AppError(WeaveError::Validation(format!(
                "Unknown search kind '{}'",
                other
            ))))
        }
    };
    let max_results = body.max_results.unwrap_or(10);
    if max_results > 100 {
        return Err(AppError(WeaveError::Validation(
            "max_results must be at most 100".to_string(),
        )));
    }

    let mut request = SearchRequest::new(body.query.unwrap_or_default(), kind)
        .with_max_results(max_results)
        .with_groups(body.group_ids.unwrap_or_default())
        .with_labels(body.labels.unwrap_or_default());
    if let Some(center) = body.center_node_id {
        request = request.with_center(center);
    }
    if body.include_expired.unwrap_or(false) {
        request = request.with_expired();
    }

    let results = state.weave.search(&request).await?;
    Ok(Json(JsonResponse::ok(SearchResponse {
        kind,
        count: results.len(),
        results,
    })))
}

#[derive(Deserialize)]
struct EdgeUpdateBody {
    fact: String,
    source_entity_id: Option<Uuid>,
    target_entity_id: Option<Uuid>,
    attributes: Option<HashMap<String, Value>>,
    reason: Option<String>,
}

#[derive(Serialize)]
struct EdgeUpdateResponse {
    old_id: Uuid,
    new_id: Uuid,
}

async fn update_edge(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<EdgeUpdateBody>,
) -> AppResult<Json<JsonResponse<EdgeUpdateResponse>>> {
    let outcome = state
        .weave
        .update_edge(
            id,
            EdgeUpdate {
                fact: body.fact,
                source_entity_id: body.source_entity_id,
                target_entity_id: body.target_entity_id,
                attributes: body.attributes,
                reason: body.reason,
            },
        )
        .await?;
    Ok(Json(JsonResponse::ok(EdgeUpdateResponse {
        old_id: outcome.old_id,
        new_id: outcome.new_id,
    })))
}

async fn delete_episode(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JsonResponse<CascadeReport>>> {
    Ok(Json(JsonResponse::ok(
        state.weave.delete_episode(id).await?,
    )))
}

async fn episode_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JsonResponse<JobStatus>>> {
    match state.weave.episode_status(id).await? {
        Some(status) => Ok(Json(JsonResponse::ok(status))),
        None => Err(AppError(WeaveError::EpisodeNotFound(id))),
    }
}

use crate::error::ApiError;
use crate::AppState;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use ingestion::RawEvent;
use query::{BotParams, GraphParams, NarrativeParams, StatsParams};
use std::sync::Arc;
use tracing::warn;

pub async fn api_submit_event(
    State(state): State<Arc<AppState>>,
    raw: Result<Json<RawEvent>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(raw) = raw?;
    state.engine.submit(raw).map_err(|e| {
        warn!(error = %e, "event not accepted");
        ApiError::from(e)
    })?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn api_narratives(
    State(state): State<Arc<AppState>>,
    params: Result<Query<NarrativeParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    Ok(Json(state.engine.query().narratives(&params)?))
}

pub async fn api_narrative_detail(
    State(state): State<Arc<AppState>>,
    id: Result<Path<String>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.engine.query().narrative(&id)?))
}

pub async fn api_narrative_origin(
    State(state): State<Arc<AppState>>,
    id: Result<Path<String>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.engine.query().origin(&id)?))
}

pub async fn api_bots(
    State(state): State<Arc<AppState>>,
    params: Result<Query<BotParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    Ok(Json(state.engine.query().bots(&params)?))
}

pub async fn api_communities(
    State(state): State<Arc<AppState>>,
    params: Result<Query<GraphParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    Ok(Json(state.engine.query().graph(&params)?))
}

pub async fn api_stats(
    State(state): State<Arc<AppState>>,
    params: Result<Query<StatsParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    Ok(Json(state.engine.query().stats(&params)?))
}

pub async fn api_user(
    State(state): State<Arc<AppState>>,
    handle: Result<Path<String>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(handle) = handle?;
    Ok(Json(state.engine.query().user(&handle)?))
}

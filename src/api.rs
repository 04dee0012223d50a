use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::engine::{ConfidenceEngine, WindowResult};
use crate::error::EngineError;
use crate::features::FeatureSet;
use crate::history::{HistoryEntry, HistoryStats};
use crate::optimizer::FeedbackRecord;
use crate::predictor::PredictionReport;
use crate::scoring::ConfidenceResult;
use crate::stream::StreamEvent;
use crate::tracker::ConvergenceState;
use crate::weights::VersionedWeights;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConfidenceEngine>,
}

pub fn create_router(engine: Arc<ConfidenceEngine>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/entities/{id}", axum::routing::delete(stop_tracking))
        .route("/entities/{id}/score", post(score))
        .route("/entities/{id}/record", post(record))
        .route("/entities/{id}/history", get(history))
        .route("/entities/{id}/stats", get(stats))
        .route("/entities/{id}/convergence", get(convergence))
        .route("/entities/{id}/prediction", get(prediction))
        .route("/entities/{id}/reset", post(reset))
        .route("/entities/{id}/events", post(ingest_event))
        .route("/entities/{id}/flush", post(flush))
        .route("/weights", get(weights))
        .route("/feedback", post(feedback))
        .layer(CorsLayer::very_permissive())
        .with_state(AppState { engine })
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::InvalidEntityState { .. } => StatusCode::CONFLICT,
            EngineError::UnknownEntity { .. } => StatusCode::NOT_FOUND,
            EngineError::Config(_) | EngineError::MissingFeature { .. } => StatusCode::BAD_REQUEST,
            EngineError::Store(_) | EngineError::DegenerateWeights | EngineError::NonConvergentTrend { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(ErrorBody { error: self.to_string() });
        match self {
            EngineError::CapacityExceeded { retry_after, .. } => {
                // Retry-After is whole seconds
                let secs = retry_after.as_millis().div_ceil(1000).max(1).to_string();
                (status, [(header::RETRY_AFTER, secs)], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

#[derive(Deserialize)]
struct ScoreQuery {
    #[serde(default)]
    record: bool,
}

#[derive(Serialize)]
struct ScoreResp {
    #[serde(flatten)]
    result: ConfidenceResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
}

async fn score(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ScoreQuery>,
    Json(features): Json<FeatureSet>,
) -> Result<Json<ScoreResp>, EngineError> {
    if q.record {
        let entry = state.engine.score_and_record(&id, &features)?;
        return Ok(Json(ScoreResp {
            result: entry.result,
            sequence: Some(entry.sequence),
        }));
    }
    Ok(Json(ScoreResp {
        result: state.engine.score(&id, &features),
        sequence: None,
    }))
}

#[derive(Deserialize)]
struct RecordReq {
    result: ConfidenceResult,
    #[serde(default)]
    expected_sequence: Option<u64>,
}

async fn record(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RecordReq>,
) -> Result<(StatusCode, Json<HistoryEntry>), EngineError> {
    let entry = match body.expected_sequence {
        Some(seq) => state.engine.record_at(&id, seq, body.result)?,
        None => state.engine.record(&id, body.result)?,
    };
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn history(State(state): State<AppState>, Path(id): Path<String>) -> Json<Vec<HistoryEntry>> {
    Json(state.engine.history(&id))
}

async fn stats(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<HistoryStats>, EngineError> {
    state
        .engine
        .stats(&id)
        .map(Json)
        .ok_or(EngineError::UnknownEntity { entity_id: id })
}

async fn convergence(State(state): State<AppState>, Path(id): Path<String>) -> Json<ConvergenceState> {
    Json(state.engine.classify(&id))
}

#[derive(Deserialize)]
struct PredictionQuery {
    target: Option<f64>,
}

async fn prediction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<PredictionQuery>,
) -> Json<PredictionReport> {
    Json(state.engine.predict(&id, q.target))
}

async fn reset(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, EngineError> {
    state.engine.reset(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct StopResp {
    released: bool,
}

async fn stop_tracking(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<StopResp>, EngineError> {
    let released = state.engine.stop_tracking(&id)?;
    Ok(Json(StopResp { released }))
}

async fn ingest_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(event): Json<StreamEvent>,
) -> Result<StatusCode, EngineError> {
    state.engine.ingest_event(&id, event)?;
    Ok(StatusCode::ACCEPTED)
}

async fn flush(State(state): State<AppState>, Path(id): Path<String>) -> Json<Vec<WindowResult>> {
    Json(state.engine.flush_window(&id))
}

async fn weights(State(state): State<AppState>) -> Json<VersionedWeights> {
    Json(state.engine.weights().as_ref().clone())
}

async fn feedback(State(state): State<AppState>, Json(batch): Json<Vec<FeedbackRecord>>) -> Json<VersionedWeights> {
    Json(state.engine.submit_feedback(&batch).as_ref().clone())
}

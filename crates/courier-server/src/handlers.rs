use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use courier_core::{ChannelType, ConversationChannelKey};
use courier_engine::projections::DEFAULT_PAGE_SIZE;
use courier_engine::{DispatchOutcome, InboundMessage, OutboundIntent};
use courier_store::QueueStatus;

use crate::error::ApiError;
use crate::server::AppState;

/// Liveness plus a cheap database round-trip.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.services.projections.queue_counts() {
        Ok(counts) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "healthy", "queue": counts })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unhealthy", "error": e.to_string() })),
            )
        }
    }
}

pub async fn inbound(
    State(state): State<AppState>,
    body: Result<Json<InboundMessage>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(message) = body?;
    let window = state.services.dispatcher.record_inbound(&message)?;
    Ok(Json(window))
}

/// `200` when sent directly, `202` when queued.
pub async fn outbound(
    State(state): State<AppState>,
    body: Result<Json<OutboundIntent>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(intent) = body?;
    let outcome = state.services.dispatcher.dispatch(&intent).await?;
    let status = match outcome {
        DispatchOutcome::Sent { .. } => StatusCode::OK,
        DispatchOutcome::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

pub async fn compliance(
    State(state): State<AppState>,
    Path((conversation_id, channel)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let channel_type: ChannelType = channel.parse().map_err(ApiError::bad_request)?;
    let key = ConversationChannelKey::new(conversation_id, channel_type);
    let decision = state.services.gate.evaluate(&key, state.services.clock.now());
    Ok(Json(decision))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsQuery {
    pub expiring_within_minutes: Option<u32>,
}

/// Open windows, or only those closing soon when `expiringWithinMinutes` is set.
pub async fn windows(
    State(state): State<AppState>,
    query: Result<Query<WindowsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let now = state.services.clock.now();
    let rows = match query.expiring_within_minutes {
        Some(minutes) => state
            .services
            .projections
            .list_expiring_windows(now, chrono::Duration::minutes(i64::from(minutes)))?,
        None => state.services.projections.list_open_windows(now)?,
    };
    Ok(Json(rows))
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn queue(
    State(state): State<AppState>,
    query: Result<Query<QueueQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<QueueStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let entries = state.services.projections.list_queue(
        status,
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        query.offset.unwrap_or(0),
    )?;
    Ok(Json(entries))
}

pub async fn queue_counts(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.services.projections.queue_counts()?))
}

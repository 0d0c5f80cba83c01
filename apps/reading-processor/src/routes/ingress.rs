use axum::body::Bytes;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::Ordering;

use crate::error::AppResult;
use crate::ingest::{decode_push, IngestError, IngestStatsSnapshot, Source};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub collection: String,
    pub mqtt_connected: bool,
    pub ingest: IngestStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    pub status: &'static str,
    pub id: String,
}

pub(crate) async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        collection: state.ingestor.collection().to_string(),
        mqtt_connected: state.mqtt_connected.load(Ordering::Relaxed),
        ingest: state.ingestor.stats().snapshot(),
    })
}

pub(crate) async fn push_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<PushResponse>> {
    let pushed = decode_push(&body).inspect_err(|_: &IngestError| {
        state.ingestor.stats().record_rejected();
    })?;
    tracing::debug!(
        message_id = pushed.message_id.as_deref().unwrap_or("-"),
        subscription = pushed.subscription.as_deref().unwrap_or("-"),
        "push message received"
    );
    let id = state.ingestor.ingest(pushed.record, Source::Push).await?;
    Ok(Json(PushResponse { status: "OK", id }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(status_handler).post(push_handler))
}

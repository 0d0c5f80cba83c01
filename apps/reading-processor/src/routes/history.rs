use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::error::AppResult;
use crate::ingest::RECEIVED_AT_FIELD;
use crate::state::AppState;
use crate::store::Record;

/// Newest stored readings, capped at the configured history limit.
pub async fn latest_records(state: &AppState) -> AppResult<Vec<Record>> {
    let ingestor = &state.ingestor;
    let records = ingestor
        .store()
        .query(ingestor.collection(), RECEIVED_AT_FIELD, state.history_limit)
        .await?;
    Ok(records)
}

pub(crate) async fn history_handler(State(state): State<AppState>) -> AppResult<Json<Vec<Record>>> {
    Ok(Json(latest_records(&state).await?))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/history", get(history_handler))
}

use crate::emitter::{DeviceHandle, DeviceStatus};
use crate::run_state::{RunState, Transition};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub run_state: Arc<RunState>,
    pub devices: Arc<Vec<DeviceHandle>>,
    pub topic: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    emitting: bool,
    topic: String,
    message: &'static str,
    devices: Vec<DeviceStatus>,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    status: &'static str,
    emitting: bool,
    message: &'static str,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    let emitting = state.run_state.is_emitting();
    Json(StatusResponse {
        status: if emitting { "running" } else { "stopped" },
        emitting,
        topic: state.topic.clone(),
        message: if emitting {
            "Call /stop to pause emission."
        } else {
            "Call /start to resume emission."
        },
        devices: state.devices.iter().map(DeviceHandle::status).collect(),
    })
}

async fn stop(State(state): State<HttpState>) -> Json<ControlResponse> {
    let response = match state.run_state.pause() {
        Transition::Changed => {
            tracing::info!("stop requested; emitters paused");
            ControlResponse {
                status: "Success",
                emitting: false,
                message: "Emission paused.",
            }
        }
        Transition::Unchanged => ControlResponse {
            status: "Already Stopped",
            emitting: false,
            message: "Emitters are already paused.",
        },
    };
    Json(response)
}

async fn start(State(state): State<HttpState>) -> Json<ControlResponse> {
    let response = match state.run_state.resume() {
        Transition::Changed => {
            tracing::info!("start requested; emitters resumed");
            ControlResponse {
                status: "Success",
                emitting: true,
                message: "Emission resumed.",
            }
        }
        Transition::Unchanged => ControlResponse {
            status: "Already Running",
            emitting: true,
            message: "Emitters are already running.",
        },
    };
    Json(response)
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(get_status))
        .route("/healthz", get(healthz))
        .route("/stop", get(stop).post(stop))
        .route("/start", get(start).post(start))
        .with_state(state)
}

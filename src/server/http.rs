//! HTTP collaborator surface.
//!
//! Thin routes over the blob store and registry:
//! - `GET /health` - liveness probe
//! - `GET /list-files` - names in the server-side store
//! - `POST /start-download/{name}` - push a fetch command to every agent
//! - `GET /secure-file/{name}` - key-gated file download used by agents

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::timing_safe_eq;
use crate::protocol::Envelope;
use crate::registry::Role;
use crate::server::RelayState;
use crate::storage::StorageError;

pub async fn health_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": state.start_time.elapsed().as_millis() as u64,
        "agentsConnected": state.relay.registry().count(Role::Agent),
        "clientsConnected": state.relay.registry().count(Role::Client),
    }))
}

pub async fn list_files_handler(State(state): State<Arc<RelayState>>) -> Response {
    match state.store.list() {
        Ok(files) => Json(json!({ "files": files })).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to list files");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Error listing files")
        }
    }
}

pub async fn start_download_handler(
    State(state): State<Arc<RelayState>>,
    Path(name): Path<String>,
) -> Response {
    if !state.store.exists(&name) {
        return error_response(StatusCode::NOT_FOUND, "File not found");
    }
    let delivered = state
        .relay
        .registry()
        .broadcast(Role::Agent, &Envelope::Download { file: name.clone() });
    if delivered == 0 {
        warn!(file = %name, "download requested with no agent connected");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "No agent connected");
    }
    info!(file = %name, agents = delivered, "download command sent");
    Json(json!({ "status": "Download started" })).into_response()
}

pub async fn secure_file_handler(
    State(state): State<Arc<RelayState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let provided = headers.get("api-key").and_then(|v| v.to_str().ok());
    let authorized = match (state.api_key.as_deref(), provided) {
        (Some(expected), Some(given)) => timing_safe_eq(expected, given),
        _ => false,
    };
    if !authorized {
        return error_response(StatusCode::FORBIDDEN, "Invalid API key");
    }

    match state.store.read(&name) {
        Ok(bytes) => {
            info!(file = %name, "secure file served");
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                bytes,
            )
                .into_response()
        }
        Err(StorageError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "File not found"),
        Err(StorageError::InvalidName(_)) => {
            error_response(StatusCode::BAD_REQUEST, "Invalid filename")
        }
        Err(err) => {
            warn!(file = %name, error = %err, "failed to read secure file");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Error reading file")
        }
    }
}

fn error_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

//! Health check endpoint for liveness probes.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::AppState;
use crate::delivery::Callback;

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
    channels: usize,
    groups: usize,
}

/// Health check handler.
///
/// Always 200 while the server is accepting connections.
///
/// # Example
///
/// ```ignore
/// GET /health HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: application/json
///
/// {"status": "ok", "channels": 3, "groups": 2}
/// ```
pub async fn health_handler<C: Callback>(State(state): State<AppState<C>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        channels: state.hub().log().channels().len(),
        groups: state.hub().groups().len(),
    })
}

//! Operator endpoints under `/internal`.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::AppState;
use super::error::{ApiError, Result};
use crate::delivery::{Callback, DeliveryError};
use crate::types::GroupName;

/// `GET /internal/channel/refresh`
///
/// Wakes every worker so it re-checks its channel, including reattaching
/// to a channel that was deleted and created again.
pub async fn refresh<C: Callback>(State(state): State<AppState<C>>) -> StatusCode {
    info!("refresh requested");
    state.hub().refresh();
    StatusCode::OK
}

#[derive(Debug, Serialize)]
struct GroupErrors {
    name: GroupName,
    href: String,
    errors: Vec<DeliveryError>,
}

/// `GET /internal/webhook`
pub async fn groups_with_errors<C: Callback>(
    State(state): State<AppState<C>>,
) -> impl IntoResponse {
    let links = state.links();
    let groups: Vec<GroupErrors> = state
        .hub()
        .groups_with_errors()
        .into_iter()
        .map(|(name, errors)| GroupErrors {
            href: links.group("webhook", &name),
            name,
            errors,
        })
        .collect();
    Json(groups)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StaleGroup {
    name: GroupName,
    href: String,
    last_completed_at: DateTime<Utc>,
}

/// `GET /internal/webhook/stale/{age}`
///
/// Groups whose last completed item is more than `age` minutes old, oldest
/// first.
pub async fn stale_groups<C: Callback>(
    State(state): State<AppState<C>>,
    Path(age): Path<String>,
) -> Result<impl IntoResponse> {
    let max_age = age
        .parse::<i64>()
        .ok()
        .filter(|m| *m >= 0)
        .and_then(chrono::Duration::try_minutes)
        .ok_or_else(|| ApiError::InvalidParam(format!("age {age:?}")))?;
    let links = state.links();
    let groups: Vec<StaleGroup> = state
        .hub()
        .stale_groups(max_age, Utc::now())
        .into_iter()
        .map(|(name, last_completed_at)| StaleGroup {
            href: links.group("webhook", &name),
            name,
            last_completed_at,
        })
        .collect();
    Ok(Json(groups))
}

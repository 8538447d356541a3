//! Subscription group endpoints.
//!
//! Groups are addressable as `/webhook/{name}` and `/group/{name}`; both
//! families share handlers, and links in responses use the family the
//! request came in on.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{MatchedPath, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use super::error::Result;
use super::{AppState, Href, NamedHref};
use crate::delivery::{Callback, DeliveryError};
use crate::hub::GroupView;
use crate::links::Links;
use crate::types::{BatchMode, GroupName, GroupSpec, SequenceId, SubscriptionGroup};

fn family(path: &MatchedPath) -> &'static str {
    if path.as_str().starts_with("/group") {
        "group"
    } else {
        "webhook"
    }
}

#[derive(Debug, Serialize)]
struct GroupLinks {
    #[serde(rename = "self")]
    self_: Href,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupBody {
    #[serde(rename = "_links")]
    links: GroupLinks,
    name: GroupName,
    callback_url: String,
    channel_url: String,
    batch: BatchMode,
    transactional: bool,
    ttl_minutes: u64,
    max_wait_minutes: u64,
    parallel_calls: u32,
}

impl GroupBody {
    fn new(group: SubscriptionGroup, family: &str, links: &Links) -> Self {
        GroupBody {
            links: GroupLinks {
                self_: Href::new(links.group(family, &group.name)),
            },
            name: group.name,
            callback_url: group.callback_url,
            channel_url: group.channel_url,
            batch: group.batch,
            transactional: group.transactional,
            ttl_minutes: group.ttl_minutes,
            max_wait_minutes: group.max_wait_minutes,
            parallel_calls: group.parallel_calls,
        }
    }
}

/// A group plus its live delivery status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupStatusBody {
    #[serde(flatten)]
    group: GroupBody,
    last_completed: String,
    state: &'static str,
    in_flight: Vec<String>,
    errors: Vec<DeliveryError>,
}

impl GroupStatusBody {
    fn new(view: GroupView, family: &str, links: &Links) -> Self {
        let channel = view.group.channel.clone();
        let last_delivered = view.cursor.last_delivered;
        let last_completed = if last_delivered > SequenceId::ZERO {
            links.item(&channel, last_delivered)
        } else {
            view.group.channel_url.clone()
        };
        let (state, in_flight, errors): (&'static str, Vec<String>, Vec<DeliveryError>) =
            match view.status {
            Some(status) => (
                status.state.as_str(),
                status
                    .in_flight
                    .iter()
                    .map(|id| links.item(&channel, *id))
                    .collect(),
                status.errors.into_iter().collect(),
            ),
            None => ("STOPPED", Vec::new(), Vec::new()),
        };
        GroupStatusBody {
            group: GroupBody::new(view.group, family, links),
            last_completed,
            state,
            in_flight,
            errors,
        }
    }
}

fn group_name(raw: String) -> Result<GroupName> {
    Ok(GroupName::new(raw)?)
}

/// `PUT /webhook/{name}` and `PUT /group/{name}`
///
/// Creates the group (201 with `Location`) or updates its mutable fields
/// (200). A new group starts after the channel's current latest item.
///
/// # Example
///
/// ```ignore
/// PUT /webhook/audit HTTP/1.1
/// Content-Type: application/json
///
/// {"callbackUrl": "http://client/cb", "channelUrl": "http://hub/channel/orders"}
///
/// HTTP/1.1 201 Created
/// Location: http://hub/webhook/audit
/// ```
pub async fn put_group<C: Callback>(
    State(state): State<AppState<C>>,
    matched: MatchedPath,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let name = group_name(name)?;
    let spec: GroupSpec = serde_json::from_slice(&body)?;
    let (group, created) = state.hub().put_group(name, spec)?;

    let body = GroupBody::new(group, family(&matched), state.links());
    if created {
        let location = body.links.self_.href.clone();
        Ok((
            StatusCode::CREATED,
            [(header::LOCATION, location)],
            Json(body),
        )
            .into_response())
    } else {
        Ok(Json(body).into_response())
    }
}

/// `GET /webhook/{name}` and `GET /group/{name}`
pub async fn get_group<C: Callback>(
    State(state): State<AppState<C>>,
    matched: MatchedPath,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let view = state.hub().group(&group_name(name)?)?;
    Ok(Json(GroupStatusBody::new(
        view,
        family(&matched),
        state.links(),
    )))
}

/// `DELETE /webhook/{name}` and `DELETE /group/{name}`
///
/// Responds 202 at once; the worker stops within the stop grace period.
pub async fn delete_group<C: Callback>(
    State(state): State<AppState<C>>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.hub().delete_group(&group_name(name)?)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
struct GroupListLinks {
    #[serde(rename = "self")]
    self_: Href,
    groups: Vec<NamedHref>,
}

#[derive(Debug, Serialize)]
struct GroupListBody {
    #[serde(rename = "_links")]
    links: GroupListLinks,
}

/// `GET /webhook` and `GET /group`
pub async fn list_groups<C: Callback>(
    State(state): State<AppState<C>>,
    matched: MatchedPath,
) -> impl IntoResponse {
    let family = family(&matched);
    let links = state.links();
    let groups = state
        .hub()
        .groups()
        .into_iter()
        .map(|group| NamedHref::new(group.name.as_str(), links.group(family, &group.name)))
        .collect();
    Json(GroupListBody {
        links: GroupListLinks {
            self_: Href::new(format!("{}/{}", links.base(), family)),
            groups,
        },
    })
}

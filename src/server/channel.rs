//! Channel, item and tag endpoints.

use std::collections::BTreeSet;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{ApiError, Result};
use super::{AppState, Href, NamedHref};
use crate::delivery::Callback;
use crate::links::Links;
use crate::types::{
    ChannelConfig, ChannelName, ChannelPatch, CreateChannel, Item, SequenceId, normalize_tags,
};

/// Item header carrying the ISO-8601 append timestamp.
pub const HEADER_ITEM_TIMESTAMP: &str = "x-item-timestamp";
/// Item header carrying the comma-separated tags.
pub const HEADER_ITEM_TAGS: &str = "x-item-tags";

#[derive(Debug, Serialize)]
struct ChannelLinks {
    #[serde(rename = "self")]
    self_: Href,
    latest: Href,
}

/// A channel as returned to clients.
#[derive(Debug, Serialize)]
pub struct ChannelBody {
    #[serde(rename = "_links")]
    links: ChannelLinks,
    #[serde(flatten)]
    config: ChannelConfig,
}

impl ChannelBody {
    fn new(config: ChannelConfig, links: &Links) -> Self {
        ChannelBody {
            links: ChannelLinks {
                self_: Href::new(links.channel(&config.name)),
                latest: Href::new(links.latest(&config.name)),
            },
            config,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemLinks {
    #[serde(rename = "self")]
    self_: Href,
    channel: Href,
}

/// Response to an item append.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    #[serde(rename = "_links")]
    links: ItemLinks,
    sequence_id: SequenceId,
    timestamp: String,
    tags: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
struct ListLinks<T: Serialize> {
    #[serde(rename = "self")]
    self_: Href,
    #[serde(flatten)]
    entries: T,
}

#[derive(Debug, Serialize)]
struct ListBody<T: Serialize> {
    #[serde(rename = "_links")]
    links: ListLinks<T>,
}

fn list<T: Serialize>(self_href: String, entries: T) -> Json<ListBody<T>> {
    Json(ListBody {
        links: ListLinks {
            self_: Href::new(self_href),
            entries,
        },
    })
}

#[derive(Debug, Serialize)]
struct ChannelEntries {
    channels: Vec<NamedHref>,
}

#[derive(Debug, Serialize)]
struct TagEntries {
    tags: Vec<NamedHref>,
}

#[derive(Debug, Serialize)]
struct UriEntries {
    uris: Vec<String>,
}

fn channel_name(raw: String) -> Result<ChannelName> {
    Ok(ChannelName::new(raw)?)
}

/// `POST /channel`
///
/// Creates a channel. Responds 201 with a `Location` header and the channel
/// body; tags come back de-duplicated and sorted.
pub async fn create_channel<C: Callback>(
    State(state): State<AppState<C>>,
    body: Bytes,
) -> Result<Response> {
    let request: CreateChannel = serde_json::from_slice(&body)?;
    let config = state.hub().create_channel(request)?;
    let body = ChannelBody::new(config, state.links());
    let location = body.links.self_.href.clone();
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(body),
    )
        .into_response())
}

/// `GET /channel`
pub async fn list_channels<C: Callback>(State(state): State<AppState<C>>) -> impl IntoResponse {
    let links = state.links();
    let channels = state
        .hub()
        .log()
        .channels()
        .into_iter()
        .map(|config| NamedHref::new(config.name.as_str(), links.channel(&config.name)))
        .collect();
    list(links.channels(), ChannelEntries { channels })
}

/// `GET /channel/{name}`
pub async fn get_channel<C: Callback>(
    State(state): State<AppState<C>>,
    Path(name): Path<String>,
) -> Result<Json<ChannelBody>> {
    let config = state.hub().log().channel(&channel_name(name)?)?;
    Ok(Json(ChannelBody::new(config, state.links())))
}

/// `PATCH /channel/{name}`
///
/// `ttlMillis: null` clears the TTL; omitting it leaves the TTL unchanged.
pub async fn update_channel<C: Callback>(
    State(state): State<AppState<C>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<ChannelBody>> {
    let name = channel_name(name)?;
    let patch: ChannelPatch = serde_json::from_slice(&body)?;
    let config = state.hub().update_channel(&name, patch)?;
    Ok(Json(ChannelBody::new(config, state.links())))
}

/// `DELETE /channel/{name}`
pub async fn delete_channel<C: Callback>(
    State(state): State<AppState<C>>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.hub().delete_channel(&channel_name(name)?)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Default, Deserialize)]
pub struct AppendParams {
    /// Comma-separated item tags.
    tags: Option<String>,
}

/// `POST /channel/{name}`
///
/// Appends the request body as an item. The stored content type is the
/// request's `Content-Type`; tags come from `?tags=a,b`.
///
/// # Example
///
/// ```ignore
/// POST /channel/orders?tags=eu,priority HTTP/1.1
/// Content-Type: text/plain
///
/// hello
///
/// HTTP/1.1 201 Created
/// Location: http://localhost:8080/channel/orders/7
///
/// {"_links": {...}, "sequenceId": 7, "timestamp": "2024-01-15T12:00:00.000Z", "tags": ["eu", "priority"]}
/// ```
pub async fn append_item<C: Callback>(
    State(state): State<AppState<C>>,
    Path(name): Path<String>,
    Query(params): Query<AppendParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let name = channel_name(name)?;
    let tags: Vec<String> = params
        .tags
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .filter(|t| !t.trim().is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let tags = normalize_tags(&tags)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let item = state.hub().append(&name, body.to_vec(), content_type, tags)?;

    let links = state.links();
    let location = links.item(&item.channel, item.sequence_id);
    let body = ItemBody {
        links: ItemLinks {
            self_: Href::new(location.clone()),
            channel: Href::new(links.channel(&item.channel)),
        },
        sequence_id: item.sequence_id,
        timestamp: item.timestamp_iso(),
        tags: item.tags.clone(),
    };
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(body),
    )
        .into_response())
}

/// `GET /channel/{name}/{sequenceId}`
///
/// Returns the stored payload with its content type. Unknown, uncommitted
/// and expired items are 404.
pub async fn get_item<C: Callback>(
    State(state): State<AppState<C>>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Response> {
    let name = channel_name(name)?;
    let id: u64 = id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("item {id} in {name}")))?;
    let item = state
        .hub()
        .log()
        .get(&name, SequenceId(id), Utc::now())?
        .ok_or_else(|| ApiError::NotFound(format!("item {id} in {name}")))?;
    Ok(item_response(&item))
}

fn item_response(item: &Item) -> Response {
    let content_type = item
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    let tags = item.tags.iter().cloned().collect::<Vec<_>>().join(",");

    let mut response = item.payload.clone().into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Ok(ts) = HeaderValue::from_str(&item.timestamp_iso()) {
        headers.insert(HEADER_ITEM_TIMESTAMP, ts);
    }
    if let Ok(tags) = HeaderValue::from_str(&tags) {
        headers.insert(HEADER_ITEM_TAGS, tags);
    }
    response
}

/// `GET /channel/{name}/latest`
///
/// Redirects (303) to the newest live item.
pub async fn latest_item<C: Callback>(
    State(state): State<AppState<C>>,
    Path(name): Path<String>,
) -> Result<Response> {
    let name = channel_name(name)?;
    let item = state
        .hub()
        .log()
        .latest(&name, Utc::now())?
        .ok_or_else(|| ApiError::NotFound(format!("latest item in {name}")))?;
    let location = state.links().item(&name, item.sequence_id);
    debug!(channel = %name, seq = %item.sequence_id, "latest");
    Ok((StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response())
}

/// `GET /channel/{name}/tag/{tag}`
pub async fn channel_tag_items<C: Callback>(
    State(state): State<AppState<C>>,
    Path((name, tag)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let name = channel_name(name)?;
    let links = state.links();
    let uris = state
        .hub()
        .log()
        .items_with_tag(&name, &tag, Utc::now())?
        .into_iter()
        .map(|id| links.item(&name, id))
        .collect();
    Ok(list(links.channel_tag(&name, &tag), UriEntries { uris }))
}

/// `GET /tag`
pub async fn list_tags<C: Callback>(State(state): State<AppState<C>>) -> impl IntoResponse {
    let links = state.links();
    let tags = state
        .hub()
        .log()
        .all_tags()
        .into_iter()
        .map(|tag| {
            let href = links.tag(&tag);
            NamedHref::new(tag, href)
        })
        .collect();
    list(format!("{}/tag", links.base()), TagEntries { tags })
}

/// `GET /tag/{tag}`
pub async fn tag_channels<C: Callback>(
    State(state): State<AppState<C>>,
    Path(tag): Path<String>,
) -> impl IntoResponse {
    let links = state.links();
    let channels = state
        .hub()
        .log()
        .channels_with_tag(&tag)
        .into_iter()
        .map(|name| NamedHref::new(name.as_str(), links.channel(&name)))
        .collect();
    list(links.tag(&tag), ChannelEntries { channels })
}

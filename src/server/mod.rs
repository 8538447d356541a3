//! HTTP surface of the hub.
//!
//! # Endpoints
//!
//! - `POST /channel`, `GET /channel` - create and list channels
//! - `GET|PATCH|DELETE /channel/{name}` - channel configuration
//! - `POST /channel/{name}` - append an item (201 with `Location`)
//! - `GET /channel/{name}/{sequenceId}`, `GET /channel/{name}/latest` - read items
//! - `GET /channel/{name}/tag/{tag}`, `GET /tag`, `GET /tag/{tag}` - tag lookups
//! - `PUT|GET|DELETE /webhook/{name}` (alias `/group/{name}`) - subscription groups
//! - `GET /internal/channel/refresh` - wake every delivery worker
//! - `GET /internal/webhook`, `GET /internal/webhook/stale/{age}` - operator views
//! - `GET /health` - liveness

use std::sync::Arc;

use serde::Serialize;

pub mod channel;
pub mod error;
pub mod group;
pub mod health;
pub mod internal;

pub use error::ApiError;
pub use health::health_handler;

use crate::delivery::Callback;
use crate::hub::Hub;
use crate::links::Links;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
pub struct AppState<C: Callback> {
    hub: Arc<Hub<C>>,
}

impl<C: Callback> Clone for AppState<C> {
    fn clone(&self) -> Self {
        AppState {
            hub: Arc::clone(&self.hub),
        }
    }
}

impl<C: Callback> AppState<C> {
    pub fn new(hub: Arc<Hub<C>>) -> Self {
        AppState { hub }
    }

    pub fn hub(&self) -> &Hub<C> {
        &self.hub
    }

    pub fn links(&self) -> &Links {
        self.hub.links()
    }
}

/// `{"href": ...}`
#[derive(Debug, Clone, Serialize)]
pub struct Href {
    pub href: String,
}

impl Href {
    pub fn new(href: String) -> Self {
        Href { href }
    }
}

/// `{"name": ..., "href": ...}`
#[derive(Debug, Clone, Serialize)]
pub struct NamedHref {
    pub name: String,
    pub href: String,
}

impl NamedHref {
    pub fn new(name: impl Into<String>, href: String) -> Self {
        NamedHref {
            name: name.into(),
            href,
        }
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<C: Callback>(app_state: AppState<C>) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route(
            "/channel",
            get(channel::list_channels::<C>).post(channel::create_channel::<C>),
        )
        .route(
            "/channel/{name}",
            get(channel::get_channel::<C>)
                .patch(channel::update_channel::<C>)
                .delete(channel::delete_channel::<C>)
                .post(channel::append_item::<C>),
        )
        .route("/channel/{name}/latest", get(channel::latest_item::<C>))
        .route("/channel/{name}/{id}", get(channel::get_item::<C>))
        .route(
            "/channel/{name}/tag/{tag}",
            get(channel::channel_tag_items::<C>),
        )
        .route("/tag", get(channel::list_tags::<C>))
        .route("/tag/{tag}", get(channel::tag_channels::<C>))
        .route("/webhook", get(group::list_groups::<C>))
        .route("/group", get(group::list_groups::<C>))
        .route(
            "/webhook/{name}",
            get(group::get_group::<C>)
                .put(group::put_group::<C>)
                .delete(group::delete_group::<C>),
        )
        .route(
            "/group/{name}",
            get(group::get_group::<C>)
                .put(group::put_group::<C>)
                .delete(group::delete_group::<C>),
        )
        .route("/internal/channel/refresh", get(internal::refresh::<C>))
        .route("/internal/webhook", get(internal::groups_with_errors::<C>))
        .route(
            "/internal/webhook/stale/{age}",
            get(internal::stale_groups::<C>),
        )
        .route("/health", get(health_handler::<C>))
        .with_state(app_state)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use chrono::DateTime;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::time::timeout;
    use tower::ServiceExt;

    use crate::config::HubConfig;
    use crate::delivery::DeliveryEvent;
    use crate::test_utils::ScriptedCallback;

    fn test_app() -> (axum::Router, Arc<Hub<ScriptedCallback>>) {
        let hub = Arc::new(Hub::open(&HubConfig::new(), ScriptedCallback::new()).unwrap());
        (build_router(AppState::new(Arc::clone(&hub))), hub)
    }

    async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body.to_vec())
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn delete(uri: &str) -> Request<Body> {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn append(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn parse(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    async fn create_channel(app: &axum::Router, name: &str) {
        let (status, _, _) = send(app, json_request("POST", "/channel", json!({"name": name}))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    fn group_body(channel: &str) -> Value {
        json!({
            "callbackUrl": "http://client/cb",
            "channelUrl": format!("http://localhost:8080/channel/{channel}"),
        })
    }

    // ─── Health ───

    #[tokio::test]
    async fn health_reports_counts() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;

        let (status, _, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let body = parse(&body);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["channels"], 1);
        assert_eq!(body["groups"], 0);
    }

    // ─── Channels ───

    #[tokio::test]
    async fn create_channel_sorts_and_dedupes_tags() {
        let (app, _hub) = test_app();
        let (status, headers, body) = send(
            &app,
            json_request(
                "POST",
                "/channel",
                json!({"name": "tagged", "tags": ["foo-bar", "bar", "tag:z", "bar"]}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            headers[header::LOCATION],
            "http://localhost:8080/channel/tagged"
        );
        let body = parse(&body);
        assert_eq!(body["name"], "tagged");
        assert_eq!(body["tags"], json!(["bar", "foo-bar", "tag:z"]));
        assert_eq!(
            body["_links"]["self"]["href"],
            "http://localhost:8080/channel/tagged"
        );

        let (status, _, body) = send(&app, get("/channel/tagged")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse(&body)["tags"], json!(["bar", "foo-bar", "tag:z"]));
    }

    #[tokio::test]
    async fn duplicate_channel_is_409() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;
        let (status, _, _) =
            send(&app, json_request("POST", "/channel", json!({"name": "orders"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn malformed_channel_requests_are_400() {
        let (app, _hub) = test_app();
        let (status, _, _) =
            send(&app, json_request("POST", "/channel", json!({"name": "has space"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("POST")
            .uri("/channel")
            .body(Body::from("not json"))
            .unwrap();
        let (status, _, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_channel_is_404() {
        let (app, _hub) = test_app();
        let (status, _, _) = send(&app, get("/channel/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = send(&app, append("/channel/nope", "x")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn patch_with_null_ttl_clears_it_and_is_idempotent() {
        let (app, _hub) = test_app();
        send(
            &app,
            json_request("POST", "/channel", json!({"name": "ttl", "ttlMillis": 60000})),
        )
        .await;

        for _ in 0..2 {
            let (status, headers, body) = send(
                &app,
                json_request("PATCH", "/channel/ttl", json!({"ttlMillis": null})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(headers[header::CONTENT_TYPE], "application/json");
            let body = parse(&body);
            assert_eq!(body["name"], "ttl");
            assert_eq!(body["ttlMillis"], Value::Null);
        }

        let (_, _, body) = send(
            &app,
            json_request("PATCH", "/channel/ttl", json!({"ttlMillis": 5000})),
        )
        .await;
        assert_eq!(parse(&body)["ttlMillis"], 5000);

        send(
            &app,
            json_request("POST", "/channel", json!({"name": "forever", "ttlMillis": null})),
        )
        .await;
        let (_, _, body) = send(&app, get("/channel/forever")).await;
        assert_eq!(parse(&body)["ttlMillis"], Value::Null);
        let (status, _, body) = send(
            &app,
            json_request("PATCH", "/channel/forever", json!({"ttlMillis": null})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse(&body)["ttlMillis"], Value::Null);

        // Omitting the field leaves the TTL alone.
        let (_, _, body) = send(
            &app,
            json_request("PATCH", "/channel/ttl", json!({"description": "d"})),
        )
        .await;
        let body = parse(&body);
        assert_eq!(body["ttlMillis"], 5000);
        assert_eq!(body["description"], "d");
    }

    #[tokio::test]
    async fn delete_channel_is_202() {
        let (app, _hub) = test_app();
        create_channel(&app, "gone").await;
        let (status, _, _) = send(&app, delete("/channel/gone")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _, _) = send(&app, get("/channel/gone")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_channels_links_each_channel() {
        let (app, _hub) = test_app();
        create_channel(&app, "a").await;
        create_channel(&app, "b").await;

        let (_, _, body) = send(&app, get("/channel")).await;
        let body = parse(&body);
        let channels = body["_links"]["channels"].as_array().unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0]["name"], "a");
        assert_eq!(channels[1]["href"], "http://localhost:8080/channel/b");
    }

    // ─── Items ───

    #[tokio::test]
    async fn append_returns_location_and_increasing_timestamps() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;

        let mut previous = None;
        for n in 1..=5u64 {
            let (status, headers, body) =
                send(&app, append("/channel/orders?tags=eu,priority", "hello")).await;
            assert_eq!(status, StatusCode::CREATED);
            let location = format!("http://localhost:8080/channel/orders/{n}");
            assert_eq!(headers[header::LOCATION], location.as_str());

            let body = parse(&body);
            assert_eq!(body["sequenceId"], n);
            assert_eq!(body["tags"], json!(["eu", "priority"]));
            assert_eq!(body["_links"]["self"]["href"], location);
            let ts = DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap()).unwrap();
            if let Some(prev) = previous {
                assert!(ts > prev, "{ts} should be after {prev}");
            }
            previous = Some(ts);
        }
    }

    #[tokio::test]
    async fn get_item_returns_payload_and_metadata() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;
        send(&app, append("/channel/orders?tags=b,a", "payload")).await;

        let (status, headers, body) = send(&app, get("/channel/orders/1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"payload");
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[channel::HEADER_ITEM_TAGS], "a,b");
        assert!(headers.contains_key(channel::HEADER_ITEM_TIMESTAMP));

        let (status, _, _) = send(&app, get("/channel/orders/2")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = send(&app, get("/channel/orders/abc")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn latest_redirects_to_newest_item() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;

        let (status, _, _) = send(&app, get("/channel/orders/latest")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(&app, append("/channel/orders", "one")).await;
        send(&app, append("/channel/orders", "two")).await;
        let (status, headers, _) = send(&app, get("/channel/orders/latest")).await;
        assert_eq!(status, StatusCode::SEE_OTHER);
        assert_eq!(
            headers[header::LOCATION],
            "http://localhost:8080/channel/orders/2"
        );
    }

    #[tokio::test]
    async fn invalid_item_tag_is_400() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;
        let (status, _, _) = send(&app, append("/channel/orders?tags=bad%20tag", "x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // ─── Tags ───

    #[tokio::test]
    async fn tag_lookups() {
        let (app, _hub) = test_app();
        send(
            &app,
            json_request("POST", "/channel", json!({"name": "a", "tags": ["shared", "x"]})),
        )
        .await;
        send(
            &app,
            json_request("POST", "/channel", json!({"name": "b", "tags": ["shared"]})),
        )
        .await;
        send(&app, append("/channel/a?tags=hot", "1")).await;
        send(&app, append("/channel/a", "2")).await;
        send(&app, append("/channel/a?tags=hot", "3")).await;

        let (_, _, body) = send(&app, get("/tag")).await;
        let names: Vec<_> = parse(&body)["_links"]["tags"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["shared", "x"]);

        let (_, _, body) = send(&app, get("/tag/shared")).await;
        assert_eq!(parse(&body)["_links"]["channels"].as_array().unwrap().len(), 2);

        let (_, _, body) = send(&app, get("/channel/a/tag/hot")).await;
        assert_eq!(
            parse(&body)["_links"]["uris"],
            json!([
                "http://localhost:8080/channel/a/1",
                "http://localhost:8080/channel/a/3"
            ])
        );
    }

    // ─── Groups ───

    #[tokio::test]
    async fn put_group_creates_then_updates() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;

        let (status, headers, body) =
            send(&app, json_request("PUT", "/webhook/audit", group_body("orders"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            headers[header::LOCATION],
            "http://localhost:8080/webhook/audit"
        );
        let body = parse(&body);
        assert_eq!(body["name"], "audit");
        assert_eq!(body["batch"], "SINGLE");
        assert_eq!(body["parallelCalls"], 1);

        let (status, _, body) = send(
            &app,
            json_request("PUT", "/webhook/audit", json!({"batch": "BATCH", "parallelismHint": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body = parse(&body);
        assert_eq!(body["batch"], "BATCH");
        assert_eq!(body["parallelCalls"], 3);
    }

    #[tokio::test]
    async fn group_alias_uses_its_own_links() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;

        let (status, headers, _) =
            send(&app, json_request("PUT", "/group/audit", group_body("orders"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers[header::LOCATION], "http://localhost:8080/group/audit");

        let (status, _, body) = send(&app, get("/webhook/audit")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            parse(&body)["_links"]["self"]["href"],
            "http://localhost:8080/webhook/audit"
        );

        let (_, _, body) = send(&app, get("/group")).await;
        assert_eq!(
            parse(&body)["_links"]["groups"][0]["href"],
            "http://localhost:8080/group/audit"
        );
    }

    #[tokio::test]
    async fn invalid_group_bodies_are_rejected() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;

        let mut unknown_field = group_body("orders");
        unknown_field["colour"] = json!("blue");
        let (status, _, _) = send(&app, json_request("PUT", "/webhook/g", unknown_field)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) =
            send(&app, json_request("PUT", "/webhook/g", json!({"callbackUrl": "http://c"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) =
            send(&app, json_request("PUT", "/webhook/g", group_body("missing"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut wrong_name = group_body("orders");
        wrong_name["name"] = json!("other");
        let (status, _, _) = send(&app, json_request("PUT", "/webhook/g", wrong_name)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn changing_channel_url_is_409() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;
        create_channel(&app, "other").await;
        send(&app, json_request("PUT", "/webhook/g", group_body("orders"))).await;

        let (status, _, _) = send(&app, json_request("PUT", "/webhook/g", group_body("other"))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        // Resending the same channelUrl is fine.
        let (status, _, _) = send(&app, json_request("PUT", "/webhook/g", group_body("orders"))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn get_group_reports_delivery_status() {
        let (app, hub) = test_app();
        create_channel(&app, "orders").await;
        send(&app, json_request("PUT", "/webhook/g", group_body("orders"))).await;

        let (status, _, body) = send(&app, get("/webhook/g")).await;
        assert_eq!(status, StatusCode::OK);
        let body = parse(&body);
        assert_eq!(body["lastCompleted"], "http://localhost:8080/channel/orders");
        assert_eq!(body["errors"], json!([]));

        let mut events = hub.subscribe();
        send(&app, append("/channel/orders", "x")).await;
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, DeliveryEvent::Delivered { .. }) {
                break;
            }
        }

        let (_, _, body) = send(&app, get("/webhook/g")).await;
        let body = parse(&body);
        assert_eq!(body["lastCompleted"], "http://localhost:8080/channel/orders/1");
        assert_eq!(body["inFlight"], json!([]));
    }

    #[tokio::test]
    async fn delete_group_is_202_then_404() {
        let (app, _hub) = test_app();
        create_channel(&app, "orders").await;
        send(&app, json_request("PUT", "/webhook/g", group_body("orders"))).await;

        let (status, _, _) = send(&app, delete("/webhook/g")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _, _) = send(&app, get("/webhook/g")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = send(&app, delete("/webhook/g")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ─── Internal ───

    #[tokio::test]
    async fn refresh_returns_200() {
        let (app, _hub) = test_app();
        let (status, _, _) = send(&app, get("/internal/channel/refresh")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn internal_views() {
        let (app, _hub) = test_app();
        let (status, _, body) = send(&app, get("/internal/webhook")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse(&body), json!([]));

        let (status, _, body) = send(&app, get("/internal/webhook/stale/10")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse(&body), json!([]));

        let (status, _, _) = send(&app, get("/internal/webhook/stale/soon")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

//! The callback seam between a delivery worker and the outside world.
//!
//! Workers only see the [`Callback`] trait; production uses [`HttpCallback`],
//! tests substitute scripted implementations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::links::Links;
use crate::types::{BatchMode, Item, SubscriptionGroup};

/// Why a delivery attempt did not count as accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error("callback request failed: {0}")]
    Network(String),

    #[error("callback responded with status {0}")]
    Status(u16),

    #[error("no acknowledgment within {0:?}")]
    AckTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Item,
    Items,
}

/// JSON body POSTed to a group's callback URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    pub uris: Vec<String>,
    pub sequence_ids: Vec<u64>,
}

impl DeliveryPayload {
    pub fn new(group: &SubscriptionGroup, items: &[Arc<Item>], links: &Links) -> Self {
        let kind = match group.batch {
            BatchMode::Single => PayloadKind::Item,
            BatchMode::Batch | BatchMode::BatchSequential => PayloadKind::Items,
        };
        DeliveryPayload {
            name: group.name.to_string(),
            kind,
            uris: items
                .iter()
                .map(|item| links.item(&item.channel, item.sequence_id))
                .collect(),
            sequence_ids: items.iter().map(|item| item.sequence_id.get()).collect(),
        }
    }
}

/// Delivers a payload to a callback URL.
///
/// `Ok(())` means the callback accepted the payload.
pub trait Callback: Send + Sync + 'static {
    fn deliver(
        &self,
        url: &str,
        payload: &DeliveryPayload,
    ) -> impl Future<Output = Result<(), DeliveryFailure>> + Send;
}

/// POSTs payloads as JSON. Any 2xx or 3xx response is an acceptance;
/// redirects are not followed.
#[derive(Debug, Clone)]
pub struct HttpCallback {
    client: reqwest::Client,
}

impl HttpCallback {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(HttpCallback { client })
    }
}

impl Callback for HttpCallback {
    async fn deliver(&self, url: &str, payload: &DeliveryPayload) -> Result<(), DeliveryFailure> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryFailure::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(DeliveryFailure::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelName, GroupName, GroupSpec, SequenceId};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn group(batch: &str) -> SubscriptionGroup {
        let spec: GroupSpec = serde_json::from_value(serde_json::json!({
            "callbackUrl": "http://localhost:1/cb",
            "channelUrl": "http://hub/channel/orders",
            "batch": batch
        }))
        .unwrap();
        SubscriptionGroup::from_spec(GroupName::new("g").unwrap(), spec).unwrap()
    }

    fn item(seq: u64) -> Arc<Item> {
        Arc::new(Item {
            channel: ChannelName::new("orders").unwrap(),
            sequence_id: SequenceId(seq),
            timestamp: Utc::now(),
            tags: BTreeSet::new(),
            content_type: None,
            payload: Vec::new(),
        })
    }

    #[test]
    fn payload_shape() {
        let links = Links::new("http://hub");
        let single = DeliveryPayload::new(&group("SINGLE"), &[item(1)], &links);
        assert_eq!(
            serde_json::to_value(&single).unwrap(),
            serde_json::json!({
                "name": "g",
                "type": "item",
                "uris": ["http://hub/channel/orders/1"],
                "sequenceIds": [1]
            })
        );

        let batch = DeliveryPayload::new(&group("BATCH"), &[item(2), item(3)], &links);
        assert_eq!(batch.kind, PayloadKind::Items);
        assert_eq!(batch.sequence_ids, vec![2, 3]);
    }

    async fn serve(status: StatusCode) -> (SocketAddr, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new().route(
            "/cb",
            post(move |Json(body): Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, rx)
    }

    #[tokio::test]
    async fn http_callback_accepts_2xx_and_3xx() {
        let callback = HttpCallback::new(Duration::from_secs(5)).unwrap();
        let payload = DeliveryPayload::new(&group("SINGLE"), &[item(1)], &Links::new("http://hub"));

        for status in [StatusCode::OK, StatusCode::ACCEPTED, StatusCode::SEE_OTHER] {
            let (addr, mut rx) = serve(status).await;
            callback
                .deliver(&format!("http://{addr}/cb"), &payload)
                .await
                .unwrap();
            assert_eq!(rx.recv().await.unwrap()["sequenceIds"], serde_json::json!([1]));
        }
    }

    #[tokio::test]
    async fn http_callback_rejects_errors() {
        let callback = HttpCallback::new(Duration::from_secs(5)).unwrap();
        let payload = DeliveryPayload::new(&group("SINGLE"), &[item(1)], &Links::new("http://hub"));

        let (addr, _rx) = serve(StatusCode::INTERNAL_SERVER_ERROR).await;
        assert_eq!(
            callback.deliver(&format!("http://{addr}/cb"), &payload).await,
            Err(DeliveryFailure::Status(500))
        );
    }

    #[tokio::test]
    async fn http_callback_reports_network_errors() {
        let callback = HttpCallback::new(Duration::from_secs(5)).unwrap();
        let payload = DeliveryPayload::new(&group("SINGLE"), &[item(1)], &Links::new("http://hub"));

        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        assert!(matches!(
            callback.deliver(&format!("http://{addr}/cb"), &payload).await,
            Err(DeliveryFailure::Network(_))
        ));
    }
}

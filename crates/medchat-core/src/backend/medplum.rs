//! Medplum adapter: FHIR R4 REST for queries and writes, websocket
//! subscriptions (`Subscription` + `$get-ws-binding-token`) for live updates.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::bundle::Bundle;
use super::search::SearchParams;
use super::{id_of, resource_type_of, BackendError, FhirBackend, Patch, SubscriptionEvent, SubscriptionStream};
use crate::config::CoreConfig;
use crate::constants::resource_types;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";
const SUBSCRIPTION_BUFFER: usize = 64;

/// Result of `Subscription/{id}/$get-ws-binding-token`
#[derive(Debug, Clone, PartialEq)]
pub struct BindingToken {
    pub token: String,
    pub websocket_url: Option<String>,
}

/// How a websocket session ended
enum SessionEnd {
    Cancelled,
    Closed,
    Failed(String),
}

#[derive(Clone)]
pub struct MedplumClient {
    http_client: reqwest::Client,
    fhir_base: Url,
    websocket_override: Option<String>,
    default_websocket_url: String,
    access_token: Option<String>,
    reconnect_delay: Duration,
}

impl MedplumClient {
    pub fn new(config: &CoreConfig) -> Result<Self, BackendError> {
        let fhir_base_url = config.fhir_base_url();
        info!("Creating MedplumClient with FHIR base: {}", fhir_base_url);

        let fhir_base = Url::parse(&fhir_base_url)
            .map_err(|e| BackendError::Url(format!("Invalid URL '{}': {}", fhir_base_url, e)))?;
        if !matches!(fhir_base.scheme(), "http" | "https") {
            return Err(BackendError::Url(format!(
                "URL must use http or https scheme, got: {}",
                fhir_base.scheme()
            )));
        }

        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http_client,
            fhir_base,
            websocket_override: config.websocket_url.clone(),
            default_websocket_url: config.default_websocket_url(),
            access_token: config.access_token.clone(),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        })
    }

    fn resource_url(&self, path: &str) -> Result<Url, BackendError> {
        self.fhir_base
            .join(path)
            .map_err(|e| BackendError::Url(format!("Invalid resource path '{}': {}", path, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            reqwest::StatusCode::UNAUTHORIZED => Err(BackendError::Unauthorized),
            reqwest::StatusCode::NOT_FOUND => {
                Err(BackendError::NotFound(response.url().path().to_string()))
            }
            reqwest::StatusCode::CONFLICT | reqwest::StatusCode::PRECONDITION_FAILED => {
                Err(BackendError::Conflict(response.text().await.unwrap_or_default()))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(BackendError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    pub async fn binding_token(&self, subscription_id: &str) -> Result<BindingToken, BackendError> {
        let url = self.resource_url(&format!(
            "{}/{}/$get-ws-binding-token",
            resource_types::SUBSCRIPTION,
            subscription_id
        ))?;
        let response = self.authorize(self.http_client.get(url)).send().await?;
        let parameters: Value = self.handle_response(response).await?;
        parse_binding_token(&parameters)
    }

    async fn delete_subscription(&self, subscription_id: &str) {
        let path = format!("{}/{}", resource_types::SUBSCRIPTION, subscription_id);
        let Ok(url) = self.resource_url(&path) else {
            return;
        };
        match self.authorize(self.http_client.delete(url)).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Deleted {}", path);
            }
            Ok(response) => warn!("Failed to delete {}: {}", path, response.status()),
            Err(e) => warn!("Failed to delete {}: {}", path, e),
        }
    }

    async fn open_socket(&self, subscription_id: &str) -> Result<WsStream, BackendError> {
        let binding = self.binding_token(subscription_id).await?;
        let ws_url = self
            .websocket_override
            .clone()
            .or(binding.websocket_url)
            .unwrap_or_else(|| self.default_websocket_url.clone());

        debug!("Connecting subscription socket: {}", ws_url);
        let (mut ws, _response) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| BackendError::Websocket(format!("connect {}: {}", ws_url, e)))?;

        let bind = json!({ "type": "bind-with-token", "payload": { "token": binding.token } });
        ws.send(tungstenite::Message::Text(bind.to_string()))
            .await
            .map_err(|e| BackendError::Websocket(e.to_string()))?;
        Ok(ws)
    }

    /// Forward frames until the socket closes or the stream is cancelled
    async fn pump(
        mut ws: WsStream,
        events: &mpsc::Sender<SubscriptionEvent>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                _ = wait_cancelled(cancel_rx) => {
                    let _ = ws.close(None).await;
                    return SessionEnd::Cancelled;
                }
                frame = ws.next() => {
                    let text = match frame {
                        Some(Ok(tungstenite::Message::Text(text))) => text,
                        Some(Ok(tungstenite::Message::Close(_))) | None => return SessionEnd::Closed,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    };
                    if let Some(event) = parse_frame(&text) {
                        if events.send(event).await.is_err() {
                            return SessionEnd::Cancelled;
                        }
                    }
                }
            }
        }
    }

    /// Socket lifecycle for one subscription: bind, forward, and on a drop
    /// wait `reconnect_delay` and bind again with a fresh token.
    async fn run_subscription(
        self,
        subscription_id: String,
        events: mpsc::Sender<SubscriptionEvent>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let mut reconnecting = false;
        loop {
            let opened = tokio::select! {
                _ = wait_cancelled(&mut cancel_rx) => break,
                result = self.open_socket(&subscription_id) => result,
            };

            match opened {
                Ok(ws) => {
                    if reconnecting && events.send(SubscriptionEvent::SocketOpen).await.is_err() {
                        break;
                    }
                    match Self::pump(ws, &events, &mut cancel_rx).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Closed => info!("Subscription socket closed"),
                        SessionEnd::Failed(e) => {
                            warn!("Subscription socket failed: {}", e);
                            let _ = events.send(SubscriptionEvent::Error(e)).await;
                        }
                    }
                    let _ = events.send(SubscriptionEvent::SocketClose).await;
                }
                Err(e) => {
                    warn!("Failed to bind subscription {}: {}", subscription_id, e);
                    let _ = events.send(SubscriptionEvent::Error(e.to_string())).await;
                }
            }

            if events.is_closed() {
                break;
            }
            reconnecting = true;
            tokio::select! {
                _ = wait_cancelled(&mut cancel_rx) => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        self.delete_subscription(&subscription_id).await;
        debug!("Subscription {} stopped", subscription_id);
    }
}

/// Resolves once the stream owner cancels or goes away
async fn wait_cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Read `token` and `websocket-url` out of a `Parameters` resource
pub fn parse_binding_token(parameters: &Value) -> Result<BindingToken, BackendError> {
    let params = parameters
        .get("parameter")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::InvalidResource("Parameters without parameter".to_string()))?;

    let lookup = |name: &str, value_key: &str| {
        params
            .iter()
            .find(|p| p.get("name").and_then(Value::as_str) == Some(name))
            .and_then(|p| p.get(value_key))
            .and_then(Value::as_str)
            .map(String::from)
    };

    let token = lookup("token", "valueString")
        .ok_or_else(|| BackendError::InvalidResource("binding token missing".to_string()))?;
    Ok(BindingToken {
        token,
        websocket_url: lookup("websocket-url", "valueUrl"),
    })
}

/// Map one websocket text frame to a subscription event. Heartbeats and
/// unrecognized frames yield `None`.
pub fn parse_frame(text: &str) -> Option<SubscriptionEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Ignoring non-JSON frame: {}", e);
            return None;
        }
    };

    match value.get("resourceType").and_then(Value::as_str) {
        Some(resource_types::BUNDLE) => {
            let bundle: Bundle = serde_json::from_value(value).ok()?;
            match bundle.notification_type() {
                Some("handshake") => Some(SubscriptionEvent::Connect),
                Some("heartbeat") => None,
                Some("event-notification") => Some(SubscriptionEvent::Message(bundle)),
                _ if bundle.focus_resource().is_some() => Some(SubscriptionEvent::Message(bundle)),
                _ => None,
            }
        }
        Some("OperationOutcome") => {
            let diagnostics = value["issue"]
                .get(0)
                .and_then(|issue| issue.get("diagnostics"))
                .and_then(Value::as_str)
                .unwrap_or("subscription error");
            Some(SubscriptionEvent::Error(diagnostics.to_string()))
        }
        _ => None,
    }
}

#[async_trait]
impl FhirBackend for MedplumClient {
    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> Result<Bundle, BackendError> {
        let url = self.resource_url(resource_type)?;
        debug!("GET {} {:?}", url, params.to_query_pairs());
        let response = self
            .authorize(self.http_client.get(url))
            .query(&params.to_query_pairs())
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn create(&self, resource: Value) -> Result<Value, BackendError> {
        let resource_type = resource_type_of(&resource)?;
        let url = self.resource_url(&resource_type)?;
        debug!("POST {}", url);
        let response = self
            .authorize(self.http_client.post(url))
            .json(&resource)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn update(&self, resource: Value) -> Result<Value, BackendError> {
        let resource_type = resource_type_of(&resource)?;
        let id = id_of(&resource)
            .ok_or_else(|| BackendError::InvalidResource("update requires an id".to_string()))?;
        let url = self.resource_url(&format!("{}/{}", resource_type, id))?;
        debug!("PUT {}", url);
        let response = self
            .authorize(self.http_client.put(url))
            .json(&resource)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn patch(
        &self,
        resource_type: &str,
        id: &str,
        patch: Patch,
    ) -> Result<Value, BackendError> {
        let url = self.resource_url(&format!("{}/{}", resource_type, id))?;
        debug!("PATCH {} ({} ops)", url, patch.0.len());
        let body = serde_json::to_vec(&patch)?;
        let response = self
            .authorize(self.http_client.patch(url))
            .header(reqwest::header::CONTENT_TYPE, JSON_PATCH_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn read(&self, resource_type: &str, id: &str) -> Result<Value, BackendError> {
        let url = self.resource_url(&format!("{}/{}", resource_type, id))?;
        debug!("GET {}", url);
        let response = self.authorize(self.http_client.get(url)).send().await?;
        self.handle_response(response).await
    }

    async fn subscribe(&self, criteria: &str) -> Result<SubscriptionStream, BackendError> {
        let subscription = json!({
            "resourceType": resource_types::SUBSCRIPTION,
            "status": "active",
            "reason": "chat thread updates",
            "criteria": criteria,
            "channel": { "type": "websocket" }
        });
        let created = self.create(subscription).await?;
        let subscription_id = id_of(&created)
            .ok_or_else(|| BackendError::InvalidResource("Subscription without id".to_string()))?;
        info!("Created subscription {} for {}", subscription_id, criteria);

        let (stream, events, cancel_rx) = SubscriptionStream::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(self.clone().run_subscription(subscription_id, events, cancel_rx));
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_bad_scheme() {
        let config = CoreConfig::new("ftp://example.test");
        assert!(matches!(MedplumClient::new(&config), Err(BackendError::Url(_))));
    }

    #[test]
    fn test_resource_url_joins_fhir_base() {
        let client = MedplumClient::new(&CoreConfig::new("http://localhost:8103")).unwrap();
        assert_eq!(
            client.resource_url("Communication/abc").unwrap().as_str(),
            "http://localhost:8103/fhir/R4/Communication/abc"
        );
    }

    #[test]
    fn test_parse_binding_token() {
        let parameters = json!({
            "resourceType": "Parameters",
            "parameter": [
                { "name": "token", "valueString": "tok-1" },
                { "name": "expiration", "valueDateTime": "2024-01-01T00:00:00Z" },
                { "name": "websocket-url", "valueUrl": "wss://api.example/ws/subscriptions-r4" }
            ]
        });
        let binding = parse_binding_token(&parameters).unwrap();
        assert_eq!(binding.token, "tok-1");
        assert_eq!(
            binding.websocket_url.as_deref(),
            Some("wss://api.example/ws/subscriptions-r4")
        );

        assert!(parse_binding_token(&json!({ "parameter": [] })).is_err());
    }

    fn notification_frame(kind: &str, focus: Option<Value>) -> String {
        let mut entry = vec![json!({ "resource": { "resourceType": "SubscriptionStatus", "type": kind } })];
        if let Some(focus) = focus {
            entry.push(json!({ "resource": focus }));
        }
        json!({ "resourceType": "Bundle", "type": "history", "entry": entry }).to_string()
    }

    #[test]
    fn test_parse_frame_maps_notification_types() {
        assert_eq!(
            parse_frame(&notification_frame("handshake", None)),
            Some(SubscriptionEvent::Connect)
        );
        assert_eq!(parse_frame(&notification_frame("heartbeat", None)), None);

        let event = parse_frame(&notification_frame(
            "event-notification",
            Some(json!({ "resourceType": "Communication", "id": "t1" })),
        ));
        match event {
            Some(SubscriptionEvent::Message(bundle)) => {
                assert_eq!(bundle.focus_resource().unwrap()["id"], "t1");
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_frame_errors_and_noise() {
        let outcome = json!({
            "resourceType": "OperationOutcome",
            "issue": [{ "severity": "error", "diagnostics": "token expired" }]
        });
        assert_eq!(
            parse_frame(&outcome.to_string()),
            Some(SubscriptionEvent::Error("token expired".to_string()))
        );
        assert_eq!(parse_frame("not json"), None);
        assert_eq!(parse_frame(r#"{"type":"pong"}"#), None);
    }
}

//! WebSocket Watch Endpoint
//!
//! HTTP surface of the feed server.
//!
//! ## Protocol
//!
//! 1. Client connects to `GET /api/v1/watch` with `Authorization: Bearer <token>`
//! 2. Connection upgraded to WebSocket
//! 3. Client sends one JSON text frame holding a `SubscribeRequest`
//! 4. Server authorizes the token for the requested app name, checks the name
//!    resolves to the requested app id, or closes with 1008
//! 5. Server streams `FeedMessage` JSON text frames until either side leaves
//! 6. Later client text frames carrying a `ClientMetric` are stored as reports

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use prometheus::Registry;
use serde_json::json;
use std::sync::Arc;
use trellis_core::{ClientMetric, TrellisError, TrellisResult};
use trellis_events::ChangeObserver;

use crate::error::{ApiError, ApiResult};
use crate::lcache::LocalCaches;
use crate::stream::FeedMessage;
use crate::telemetry::render_metrics;
use crate::watch::{MessageSink, SubscribeRequest, WatchHub};

/// Close code for policy violations (RFC 6455).
const CLOSE_POLICY: u16 = 1008;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<WatchHub>,
    pub caches: Arc<LocalCaches>,
    pub observer: Arc<ChangeObserver>,
    pub registry: Registry,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/watch", get(watch_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    render_metrics(&state.registry)
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let ready = state.observer.is_ready() && !state.hub.is_shutting_down();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "ready": ready,
        "cursor": state.observer.current_cursor(),
        "watchers": state.hub.active(),
    });
    (status, Json(body)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// WebSocket upgrade handler.
pub async fn watch_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if state.hub.is_shutting_down() {
        return Err(TrellisError::Unavailable("feed server is shutting down".into()).into());
    }
    let token = bearer_token(&headers).ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, token)))
}

/// Handle an individual watch connection.
async fn handle_socket(socket: WebSocket, state: AppState, token: String) {
    let (mut sender, mut receiver) = socket.split();

    let request = match read_subscribe(&mut receiver).await {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "Invalid subscribe frame");
            close(&mut sender, &e.to_string()).await;
            return;
        }
    };

    let spec = &request.spec;
    match state.caches.authorize_watch(&token, spec).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(biz_id = spec.biz_id, app = %spec.app, "Watch rejected: unauthorized");
            close(&mut sender, "unauthorized").await;
            return;
        }
        Err(e) => {
            tracing::warn!(biz_id = spec.biz_id, app = %spec.app, error = %e, "Authorization failed");
            close(&mut sender, "authorization unavailable").await;
            return;
        }
    }

    // reads client frames until the client leaves
    let caches = state.caches.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => report_metric(&caches, &text).await,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });
    let disconnected = async {
        let _ = (&mut recv_task).await;
    };

    let sink = WsSink { sender };
    if let Err(e) = state.hub.serve(request, sink, disconnected).await {
        tracing::debug!(error = %e, "Watch connection closed with error");
    }
    recv_task.abort();
}

async fn read_subscribe(receiver: &mut SplitStream<WebSocket>) -> TrellisResult<SubscribeRequest> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return serde_json::from_str(&text).map_err(|e| {
                    TrellisError::InvalidParameter(format!("malformed subscribe request: {}", e))
                });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(TrellisError::Unavailable(e.to_string())),
        }
    }
    Err(TrellisError::Cancelled("client left before subscribing".into()))
}

async fn report_metric(caches: &LocalCaches, text: &str) {
    match serde_json::from_str::<ClientMetric>(text) {
        Ok(metric) => {
            if let Err(e) = caches.client_metrics.report(&metric).await {
                tracing::warn!(uid = %metric.uid, error = %e, "Failed to store client metric");
            }
        }
        Err(e) => tracing::debug!(error = %e, "Ignoring unrecognized client frame"),
    }
}

async fn close(sender: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let frame = CloseFrame {
        code: CLOSE_POLICY,
        reason: reason.to_string().into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}

/// Sends feed messages as JSON text frames.
struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, message: FeedMessage) -> TrellisResult<()> {
        let json = serde_json::to_string(&message)
            .map_err(|e| TrellisError::codec("feed message", e))?;
        self.sender
            .send(Message::Text(json))
            .await
            .map_err(|e| TrellisError::Unavailable(format!("websocket send failed: {}", e)))
    }
}

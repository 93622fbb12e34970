//! HTTP handlers for the Relay server.
//!
//! `GET /subscribe` upgrades to a WebSocket and registers it; `POST /publish`
//! fans the request body out to every registered socket.

use crate::config::Config;
use crate::metrics;
use anyhow::Result;
use axum::{
    extract::{
        rejection::BytesRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_relay_core::{BroadcastError, Broadcaster, Connection, Lifecycle, MessageKind};
use tenvis_relay_transport::{WebSocketConfig, WsConnection};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// Shared server state.
pub struct AppState {
    /// Subscriber registry, broadcaster and shutdown signal.
    pub relay: Lifecycle,
    /// Server configuration.
    pub config: Config,
    ws_config: WebSocketConfig,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the broadcast concurrency is invalid.
    pub fn new(config: Config) -> Result<Self> {
        let broadcaster = Broadcaster::new(config.broadcast.concurrency)?
            .with_close_timeout(Duration::from_millis(config.broadcast.close_timeout_ms));
        let relay = Lifecycle::with_broadcaster(broadcaster);
        let ws_config = WebSocketConfig {
            write_chunk_size: config.transport.write_chunk_size,
        };

        Ok(Self {
            relay,
            config,
            ws_config,
        })
    }

    fn publish_timeout(&self) -> Option<Duration> {
        match self.config.broadcast.publish_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;

    Router::new()
        .route(&transport.subscribe_path, get(subscribe_handler))
        .route(&transport.publish_path, post(publish_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(transport.max_message_size))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!(
        "Subscribe: ws://{}{}  Publish: POST http://{}{}",
        addr, config.transport.subscribe_path, addr, config.transport.publish_path
    );

    serve(listener, state, shutdown).await
}

/// Serve on `listener`. When `shutdown` resolves, every subscriber is closed
/// and the server drains.
///
/// # Errors
///
/// Returns an error if the server stops for any reason other than shutdown.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(Arc::clone(&state));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            state.relay.shutdown().await;
            metrics::set_active_subscribers(0);
        })
        .await?;

    info!("Relay server stopped");
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
        }),
    )
        .into_response()
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": state.relay.subscriber_count().await,
    }))
}

/// WebSocket upgrade handler.
async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.relay.is_shut_down() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Server shutting down");
    }

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_subscriber(socket, state)),
        Err(rejection) => {
            warn!(error = %rejection, "Error while upgrading connection to websocket");
            metrics::record_error("upgrade");
            error_response(rejection.status(), "failed to upgrade connection")
        }
    }
}

/// Register an upgraded socket, then hold it open until the peer leaves or
/// the server shuts down.
async fn handle_subscriber(socket: WebSocket, state: Arc<AppState>) {
    let (conn, mut inbound) = WsConnection::from_socket(socket, &state.ws_config);
    let conn = Arc::new(conn);
    let connection_id = conn.id().clone();

    if let Err(e) = state.relay.subscribe(conn.clone()).await {
        warn!(connection = %connection_id, error = %e, "Subscription rejected");
        return;
    }
    metrics::record_subscription();
    metrics::set_active_subscribers(state.relay.subscriber_count().await);
    debug!(connection = %connection_id, "Subscriber connected");

    let shutdown = state.relay.shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            msg = inbound.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    conn.mark_closed();
                    break;
                }
                Some(Ok(_)) => {
                    // Subscribers only listen; pings are answered by the socket itself.
                }
                Some(Err(e)) => {
                    warn!(connection = %connection_id, error = %e, "WebSocket error");
                    metrics::record_error("websocket");
                    conn.mark_closed();
                    break;
                }
            }
        }
    }

    debug!(connection = %connection_id, "Subscriber task finished");
}

/// Pick the message kind from the request's content type.
fn message_kind(headers: &HeaderMap) -> MessageKind {
    let is_binary = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/octet-stream"));

    if is_binary {
        MessageKind::Binary
    } else {
        MessageKind::Text
    }
}

/// Publish handler.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            warn!(error = %rejection, "Message too large");
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "message too large");
        }
        Err(rejection) => {
            warn!(error = %rejection, "Error while reading message body");
            return error_response(StatusCode::BAD_REQUEST, "failed to read message");
        }
    };

    if state.relay.is_shut_down() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Server shutting down");
    }

    let kind = message_kind(&headers);
    if kind == MessageKind::Text && std::str::from_utf8(&body).is_err() {
        return error_response(StatusCode::BAD_REQUEST, "message is not valid UTF-8");
    }

    let size = body.len();
    let ctx = state.relay.shutdown_token().child_token();
    let start = Instant::now();

    let publish = state.relay.publish(&ctx, kind, body);
    let outcome = match state.publish_timeout() {
        Some(limit) => tokio::time::timeout(limit, publish).await.unwrap_or_else(|_| {
            warn!(timeout_ms = limit.as_millis() as u64, "Publish timed out");
            Err(BroadcastError::Cancelled)
        }),
        None => publish.await,
    };
    metrics::record_broadcast_latency(start.elapsed().as_secs_f64());

    match outcome {
        Ok(()) => {
            metrics::record_publish(size, kind.as_str(), "ok");
            debug!(bytes = size, kind = %kind, "Published");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(BroadcastError::Closed) => {
            metrics::record_publish(size, kind.as_str(), "closed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Server shutting down")
        }
        Err(e) => {
            warn!(error = %e, "Broadcast failure");
            metrics::record_publish(size, kind.as_str(), "error");
            metrics::record_error("broadcast");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::SinkExt;
    use http_body_util::BodyExt;
    use tenvis_relay_core::CancellationToken;
    use tenvis_relay_transport::{FailAt, MemoryConnection};
    use tower::ServiceExt;

    fn test_state(config: Config) -> Arc<AppState> {
        Arc::new(AppState::new(config).unwrap())
    }

    fn publish_request(body: impl Into<Body>, content_type: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/publish");
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder.body(body.into()).unwrap()
    }

    async fn error_body(response: Response) -> ErrorResponse {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_message_kind_from_content_type() {
        let mut headers = HeaderMap::new();
        assert_eq!(message_kind(&headers), MessageKind::Text);

        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        assert_eq!(message_kind(&headers), MessageKind::Text);

        headers.insert(
            header::CONTENT_TYPE,
            "application/octet-stream".parse().unwrap(),
        );
        assert_eq!(message_kind(&headers), MessageKind::Binary);
    }

    #[tokio::test]
    async fn test_publish_success() {
        let state = test_state(Config::default());
        let conn = Arc::new(MemoryConnection::new());
        state.relay.subscribe(conn.clone()).await.unwrap();

        let response = build_router(Arc::clone(&state))
            .oneshot(publish_request("hi", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let received = conn.received().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, MessageKind::Text);
        assert_eq!(&received[0].payload[..], b"hi");
    }

    #[tokio::test]
    async fn test_publish_binary() {
        let state = test_state(Config::default());
        let conn = Arc::new(MemoryConnection::new());
        state.relay.subscribe(conn.clone()).await.unwrap();

        let response = build_router(Arc::clone(&state))
            .oneshot(publish_request(
                vec![0xffu8, 0x00, 0x10],
                Some("application/octet-stream"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(conn.received().await[0].kind, MessageKind::Binary);
    }

    #[tokio::test]
    async fn test_publish_broadcast_failure() {
        let state = test_state(Config::default());
        let conn = Arc::new(MemoryConnection::new().fail_at(FailAt::OpenWriter, "bad thing"));
        state.relay.subscribe(conn).await.unwrap();

        let response = build_router(state)
            .oneshot(publish_request("hi", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            error_body(response).await,
            ErrorResponse {
                message: "Internal Error".into()
            }
        );
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_text() {
        let state = test_state(Config::default());

        let response = build_router(state)
            .oneshot(publish_request(vec![0xffu8, 0xfe], Some("text/plain")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            error_body(response).await.message,
            "message is not valid UTF-8"
        );
    }

    #[tokio::test]
    async fn test_publish_too_large() {
        let mut config = Config::default();
        config.transport.max_message_size = 8;
        let state = test_state(config);

        let response = build_router(state)
            .oneshot(publish_request("this is more than eight bytes", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown() {
        let state = test_state(Config::default());
        state.relay.shutdown().await;

        let response = build_router(state)
            .oneshot(publish_request("hi", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_publish_timeout() {
        let mut config = Config::default();
        config.broadcast.publish_timeout_ms = 20;
        let state = test_state(config);
        let slow = Arc::new(MemoryConnection::new().write_delay(Duration::from_secs(5)));
        state.relay.subscribe(slow).await.unwrap();

        let response = build_router(state)
            .oneshot(publish_request("hi", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_subscribe_requires_upgrade() {
        let state = test_state(Config::default());

        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .uri("/subscribe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert_eq!(
            error_body(response).await.message,
            "failed to upgrade connection"
        );
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state(Config::default());
        state
            .relay
            .subscribe(Arc::new(MemoryConnection::new()))
            .await
            .unwrap();

        let response = build_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["subscribers"], 1);
    }

    #[tokio::test]
    async fn test_subscribe_and_publish_over_websocket() {
        use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

        let mut config = Config::default();
        config.broadcast.concurrency = 2;
        config.metrics.enabled = false;
        let state = test_state(config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            Arc::clone(&state),
            stop.clone().cancelled_owned(),
        ));

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client, _) = connect_async(format!("ws://{}/subscribe", addr))
                .await
                .unwrap();
            clients.push(client);
        }

        // Registration finishes on the server's upgrade task.
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.relay.subscriber_count().await < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscribers never registered");

        let response = build_router(Arc::clone(&state))
            .oneshot(publish_request("hi there", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        for client in &mut clients {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(msg, WsMessage::Text("hi there".into()));
        }

        stop.cancel();
        for client in &mut clients {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap();
            assert!(matches!(msg, Some(Ok(WsMessage::Close(_))) | None));
            let _ = client.close(None).await;
        }

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(state.relay.is_shut_down());
        assert_eq!(state.relay.subscriber_count().await, 0);
    }
}

//! HTTP and WebSocket surface using Axum.

use crate::config::ServerDescriptor;
use crate::error::{GatewayError, Result};
use crate::health::{HealthCheck, HealthOutcome};
use crate::session::{
    Session, SessionInfo, SessionRegistry, SessionServices, CLIENT_CHANNEL_BUFFER_SIZE,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, RawQuery, State, WebSocketUpgrade,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::interval;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub services: SessionServices,
    pub health: Arc<HealthCheck>,
    pub descriptor: ServerDescriptor,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::PUT, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/socket.io/", get(ws_handler))
        .route("/healthcheck", get(health_handler))
        .route("/server", get(server_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct HealthParams {
    payload: Option<String>,
}

/// Synthetic health check. Without a query string the bus is not touched and the body is empty.
async fn health_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
    Query(params): Query<HealthParams>,
) -> Response {
    if raw.as_deref().map_or(true, str::is_empty) {
        return StatusCode::OK.into_response();
    }

    let payload = params.payload.unwrap_or_default();
    match state.health.check(&payload).await {
        Ok(HealthOutcome::Healthy) => (StatusCode::OK, "Ok").into_response(),
        Ok(HealthOutcome::TimedOut) => {
            (StatusCode::REQUEST_TIMEOUT, "Request Timeout").into_response()
        }
        Err(e) => {
            debug!("Rejecting health check payload: {}", e);
            (StatusCode::BAD_REQUEST, "Bad Request").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerParams {
    callback: Option<String>,
}

/// Advertised listener descriptor, as JSON or JSONP.
async fn server_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ServerParams>,
) -> Response {
    let Some(callback) = params.callback.filter(|cb| !cb.is_empty()) else {
        return Json(&state.descriptor).into_response();
    };

    match serde_json::to_string(&state.descriptor) {
        Ok(json) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/javascript"),
            )],
            format!("{}({})", callback, json),
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to serialize server descriptor: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, remote, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, remote: SocketAddr, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_CHANNEL_BUFFER_SIZE);

    let info = SessionInfo::generate(remote.ip().to_string());
    let session = Arc::new(Session::new(info, state.services.clone(), Arc::new(tx.clone())));
    let session_id = state.registry.register(session.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.session_count() as f64);

    // Forward queued frames to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&session, &tx, msg) {
                            warn!("Session {}: dropping frame: {}", session_id, e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", session_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(TrySendError::Closed(_)) = tx.try_send(Message::Ping(Default::default())) {
                    break;
                }
            }
        }
    }

    state.registry.unregister(&session_id);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.session_count() as f64);

    info!("Session {} disconnected", session_id);
}

/// Handle a single WebSocket message.
fn handle_message(session: &Session, tx: &mpsc::Sender<Message>, msg: Message) -> Result<()> {
    match msg {
        Message::Text(text) => {
            session.on_frame(text.as_str())?;
            Ok(())
        }
        Message::Binary(data) => {
            let text = std::str::from_utf8(&data)
                .map_err(|e| GatewayError::Decode(format!("binary frame is not UTF-8: {}", e)))?;
            session.on_frame(text)?;
            Ok(())
        }
        Message::Ping(data) => tx
            .try_send(Message::Pong(data))
            .map_err(|_| GatewayError::ChannelSend),
        Message::Pong(_) | Message::Close(_) => Ok(()),
    }
}

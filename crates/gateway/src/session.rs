//! Per-connection sessions and the session registry.
//!
//! A [`Session`] is created when a client connects. It decodes each inbound frame into a
//! request, namespaces it, and spawns the request's delivery loop. Closing the session
//! cancels every delivery loop it owns.

use crate::codec::FrameCodec;
use crate::correlation::prepare_outbound;
use crate::engine::{DeliveryContext, DeliveryOutcome, Engine, ResponseSink, TimeoutPolicy};
use crate::error::{GatewayError, Result};
use crate::protocol::Message;
use async_trait::async_trait;
use axum::extract::ws::Message as WsMessage;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default buffer size for client message channels.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Identity of one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Stable, process-unique id.
    pub session_id: String,
    /// Client IP address.
    pub remote_address: String,
}

impl SessionInfo {
    pub fn new(session_id: impl Into<String>, remote_address: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            remote_address: remote_address.into(),
        }
    }

    /// New session with a fresh id.
    pub fn generate(remote_address: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), remote_address)
    }
}

/// Outbound half of a client connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Queue a text frame for the client, waiting for buffer space.
    /// Fails if the connection is gone.
    async fn emit(&self, frame: String) -> Result<()>;
}

#[async_trait]
impl FrameSink for mpsc::Sender<WsMessage> {
    async fn emit(&self, frame: String) -> Result<()> {
        self.send(WsMessage::Text(frame.into()))
            .await
            .map_err(|_| GatewayError::ConnectionClosed)
    }
}

/// Shared services every session uses.
#[derive(Clone)]
pub struct SessionServices {
    pub engine: Arc<Engine>,
    pub codec: Arc<dyn FrameCodec>,
    pub timeout_policy: Arc<dyn TimeoutPolicy>,
}

/// Encodes replies with the listener's codec and emits them on the connection.
struct SessionOutput {
    codec: Arc<dyn FrameCodec>,
    sink: Arc<dyn FrameSink>,
}

#[async_trait]
impl ResponseSink for SessionOutput {
    async fn forward(&self, response: &Message) -> Result<()> {
        let frame = self.codec.encode(response)?;
        self.sink.emit(frame).await
    }
}

/// State for a single connected client.
pub struct Session {
    info: Arc<SessionInfo>,
    /// Timestamp when the client connected.
    connected_at: i64,
    services: SessionServices,
    output: Arc<SessionOutput>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session emitting to `sink`.
    pub fn new(info: SessionInfo, services: SessionServices, sink: Arc<dyn FrameSink>) -> Self {
        let output = Arc::new(SessionOutput {
            codec: services.codec.clone(),
            sink,
        });
        Self {
            info: Arc::new(info),
            connected_at: Utc::now().timestamp_millis(),
            services,
            output,
            cancel: CancellationToken::new(),
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        &self.info.session_id
    }

    /// Whether [`Session::on_close`] has run.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle one inbound frame.
    ///
    /// Decode and routing errors are returned without touching the bus. On success the
    /// request is handed to its own delivery task, whose handle is returned.
    pub fn on_frame(&self, frame: &str) -> Result<JoinHandle<DeliveryOutcome>> {
        if self.is_closed() {
            return Err(GatewayError::ConnectionClosed);
        }

        let mut request = self.services.codec.decode(frame)?;
        prepare_outbound(&mut request, &self.info)?;

        debug!(
            "Session {}: request {} for {}",
            self.info.session_id,
            request.correlation_id,
            request.destination().map_or("", |route| route.uri.as_str())
        );

        let engine = self.services.engine.clone();
        let ctx = self.delivery_context();
        Ok(tokio::spawn(async move { engine.stream(request, &ctx).await }))
    }

    /// Destroy the session: every in-flight request is abandoned.
    pub fn on_close(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            info!(
                "Session {} closed after {}ms",
                self.info.session_id,
                Utc::now().timestamp_millis() - self.connected_at
            );
        }
    }

    fn delivery_context(&self) -> DeliveryContext {
        DeliveryContext {
            session: self.info.clone(),
            sink: self.output.clone(),
            cancel: self.cancel.child_token(),
            timeout_policy: self.services.timeout_policy.clone(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Registry of connected sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a new session.
    pub fn register(&self, session: Arc<Session>) -> String {
        let id = session.id().to_string();
        info!(
            "Session {} registered (remote {})",
            id,
            session.info().remote_address
        );
        self.sessions.insert(id.clone(), session);
        id
    }

    /// Unregister a session and abandon its in-flight requests.
    pub fn unregister(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.on_close();
        } else {
            warn!("Unregistering unknown session {}", session_id);
        }
    }

    /// Get a session by ID.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Get the number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every session, e.g. on shutdown.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.unregister(&id);
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

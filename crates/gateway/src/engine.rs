//! Request/response streaming engine.
//!
//! Publishes requests on the bus, demultiplexes replies from the gateway's reply topic
//! by correlation id, and drives one delivery loop per request:
//!
//! ```text
//! SENT ──► STREAMING ──► COMPLETED   (response with completed = true)
//!                   ├──► TIMED_OUT   (deadline passed first)
//!                   └──► ABANDONED   (session closed, or connection gone)
//! ```
//!
//! Every request owns its pending-map entry through a [`ResponseStream`]; dropping the
//! stream releases the entry, so late replies for finished requests are dropped.

use crate::correlation::{finalize_inbound, strip_namespace};
use crate::error::{GatewayError, Result};
use crate::protocol::{Message, Method, Resource, Route, RoutingStack, ROUTER_SCHEME};
use crate::session::SessionInfo;
use async_trait::async_trait;
use bus::Bus;
use bytes::Bytes;
use dashmap::DashMap;
use metrics::{counter, gauge};
use prost::Message as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bus-connection heartbeat, independent of request deadlines.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(7);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This gateway's bus identity; replies are published to it.
    pub router_uri: String,
    /// Deadline applied to client requests.
    pub request_timeout: Duration,
}

impl EngineConfig {
    pub fn new(router_uri: impl Into<String>) -> Self {
        Self {
            router_uri: router_uri.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

struct PendingEntry {
    registration: u64,
    tx: mpsc::UnboundedSender<Message>,
}

type PendingMap = DashMap<String, PendingEntry>;

/// Correlates bus replies with in-flight requests.
pub struct Engine {
    bus: Arc<dyn Bus>,
    config: EngineConfig,
    pending: Arc<PendingMap>,
    next_registration: AtomicU64,
}

impl Engine {
    /// Create an engine publishing through `bus`.
    pub fn new(bus: Arc<dyn Bus>, config: EngineConfig) -> Self {
        Self {
            bus,
            config,
            pending: Arc::new(DashMap::new()),
            next_registration: AtomicU64::new(0),
        }
    }

    /// Subscribe the reply demultiplexer. Must be called before routing.
    pub async fn start(&self) -> Result<()> {
        let pending = self.pending.clone();
        self.bus
            .subscribe(
                self.reply_topic(),
                Arc::new(move |payload| dispatch_reply(&pending, payload)),
            )
            .await?;
        info!("Engine listening for replies on '{}'", self.reply_topic());
        Ok(())
    }

    /// Topic replies are addressed to.
    pub fn reply_topic(&self) -> &str {
        &self.config.router_uri
    }

    /// Deadline applied to client requests.
    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// Number of requests currently awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Publish `msg` to the head of its `route_to` and start correlating replies.
    ///
    /// The reply subscription is registered before publishing so an immediate reply
    /// cannot be missed, and released again if the publish fails.
    pub async fn route(&self, mut msg: Message, timeout: Duration) -> Result<RouteHandle> {
        let topic = msg
            .destination()
            .map(|route| route.uri.clone())
            .ok_or(GatewayError::NoDestination)?;

        msg.routing_mut()
            .route_from
            .push(Route::with_scheme(ROUTER_SCHEME, &self.config.router_uri));

        let responses = self.register(&msg.correlation_id);
        self.bus
            .publish(&topic, Bytes::from(msg.encode_to_vec()))
            .await?;

        counter!("gateway_requests_routed_total").increment(1);
        debug!("Routed request {} to '{}'", msg.correlation_id, topic);

        Ok(RouteHandle {
            responses,
            timeout: TimeoutSignal::after(timeout),
        })
    }

    /// Route a session's request and deliver its replies until a terminal state.
    ///
    /// A request that cannot be routed ends immediately as [`DeliveryOutcome::TimedOut`].
    pub async fn stream(&self, request: Message, ctx: &DeliveryContext) -> DeliveryOutcome {
        match self.route(request.clone(), self.config.request_timeout).await {
            Ok(handle) => deliver(handle, &request, ctx).await,
            Err(e) => {
                warn!(
                    "Session {}: failed to route request {}: {}",
                    ctx.session.session_id, request.correlation_id, e
                );
                ctx.on_timeout(&request).await;
                DeliveryOutcome::TimedOut
            }
        }
    }

    fn register(&self, correlation_id: &str) -> ResponseStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);

        let entry = PendingEntry { registration, tx };
        if self
            .pending
            .insert(correlation_id.to_string(), entry)
            .is_some()
        {
            warn!("Request {} superseded an in-flight request", correlation_id);
        }
        gauge!("gateway_pending_requests").set(self.pending.len() as f64);

        ResponseStream {
            rx,
            _subscription: Subscription {
                pending: self.pending.clone(),
                correlation_id: correlation_id.to_string(),
                registration,
            },
        }
    }
}

/// Reply-topic handler: hand each reply to the request awaiting it.
fn dispatch_reply(pending: &PendingMap, payload: Bytes) {
    let reply = match Message::decode(payload) {
        Ok(reply) => reply,
        Err(e) => {
            debug!("Dropping undecodable reply: {}", e);
            return;
        }
    };

    match pending.get(&reply.correlation_id) {
        Some(entry) => {
            if entry.tx.send(reply).is_err() {
                debug!("Reply arrived while its request was finishing");
            }
        }
        None => debug!(
            "Dropping reply for unknown request {}",
            reply.correlation_id
        ),
    }
}

/// Pending-map registration, released on drop.
struct Subscription {
    pending: Arc<PendingMap>,
    correlation_id: String,
    registration: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // A newer request may have reused the id; only remove our own entry.
        self.pending
            .remove_if(&self.correlation_id, |_, entry| {
                entry.registration == self.registration
            });
        gauge!("gateway_pending_requests").set(self.pending.len() as f64);
    }
}

/// Replies correlated to one request, in arrival order.
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<Message>,
    _subscription: Subscription,
}

impl ResponseStream {
    /// Next reply. `None` once the request has been superseded.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Resolves once, when the request's deadline passes.
pub struct TimeoutSignal {
    sleep: Pin<Box<Sleep>>,
}

impl TimeoutSignal {
    fn after(timeout: Duration) -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }
}

impl Future for TimeoutSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.sleep.as_mut().poll(cx)
    }
}

/// The two signals returned by [`Engine::route`].
pub struct RouteHandle {
    pub responses: ResponseStream,
    pub timeout: TimeoutSignal,
}

/// Terminal state of a request's delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    TimedOut,
    Abandoned,
}

/// Where finalized replies go.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Forward one reply to the client, waiting while its outbound buffer is full.
    /// Fails only if the connection is gone.
    async fn forward(&self, response: &Message) -> Result<()>;
}

/// What to tell the client when a request times out.
pub trait TimeoutPolicy: Send + Sync {
    /// Reply to emit for a timed-out `request` (as prepared by the session), if any.
    fn on_timeout(&self, request: &Message, session: &SessionInfo) -> Option<Message>;
}

/// Emit nothing; the client observes silence.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentTimeout;

impl TimeoutPolicy for SilentTimeout {
    fn on_timeout(&self, _request: &Message, _session: &SessionInfo) -> Option<Message> {
        None
    }
}

/// Emit a terminal `REPLY`/`ERROR` message addressed back along the request's path.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorReplyOnTimeout;

impl TimeoutPolicy for ErrorReplyOnTimeout {
    fn on_timeout(&self, request: &Message, session: &SessionInfo) -> Option<Message> {
        let route_to = request
            .routing
            .as_ref()
            .map(|routing| routing.route_from.clone())
            .unwrap_or_default();

        Some(Message {
            correlation_id: strip_namespace(&request.correlation_id, &session.session_id)
                .to_string(),
            method: Method::Reply as i32,
            resource: Resource::Error as i32,
            body: Bytes::new(),
            routing: Some(RoutingStack {
                route_to,
                route_from: Vec::new(),
            }),
            completed: true,
        })
    }
}

/// Per-session state a delivery loop needs.
#[derive(Clone)]
pub struct DeliveryContext {
    pub session: Arc<SessionInfo>,
    pub sink: Arc<dyn ResponseSink>,
    /// Cancelled when the session is destroyed.
    pub cancel: CancellationToken,
    pub timeout_policy: Arc<dyn TimeoutPolicy>,
}

impl DeliveryContext {
    async fn on_timeout(&self, request: &Message) {
        counter!("gateway_request_timeouts_total").increment(1);
        if let Some(reply) = self.timeout_policy.on_timeout(request, &self.session) {
            if let Err(e) = self.forward(&reply).await {
                debug!(
                    "Session {}: timeout reply not delivered: {}",
                    self.session.session_id, e
                );
            }
        }
    }

    /// Forward to the sink unless the session is destroyed while waiting for room.
    async fn forward(&self, response: &Message) -> Result<()> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(GatewayError::ConnectionClosed),
            result = self.sink.forward(response) => result,
        }
    }
}

/// Forward replies for one request until completion, timeout, or abandonment.
///
/// Cancellation is checked on every wake-up. Replies arriving after the timeout or
/// after the session was destroyed are never forwarded.
pub async fn deliver(
    mut handle: RouteHandle,
    request: &Message,
    ctx: &DeliveryContext,
) -> DeliveryOutcome {
    let session_id = &ctx.session.session_id;

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => {
                debug!("Session {}: abandoning request {}", session_id, request.correlation_id);
                counter!("gateway_requests_abandoned_total").increment(1);
                return DeliveryOutcome::Abandoned;
            }

            _ = &mut handle.timeout => {
                info!("Session {}: request {} timed out", session_id, request.correlation_id);
                drop(handle);
                ctx.on_timeout(request).await;
                return DeliveryOutcome::TimedOut;
            }

            next = handle.responses.recv() => {
                let Some(mut response) = next else {
                    debug!("Session {}: request {} superseded", session_id, request.correlation_id);
                    return DeliveryOutcome::Abandoned;
                };

                if ctx.cancel.is_cancelled() {
                    counter!("gateway_requests_abandoned_total").increment(1);
                    return DeliveryOutcome::Abandoned;
                }

                finalize_inbound(&mut response, &ctx.session);
                let completed = response.completed;

                if let Err(e) = ctx.forward(&response).await {
                    debug!("Session {}: dropping response, {}", session_id, e);
                    counter!("gateway_requests_abandoned_total").increment(1);
                    return DeliveryOutcome::Abandoned;
                }
                counter!("gateway_responses_forwarded_total").increment(1);

                if completed {
                    debug!("Session {}: request {} completed", session_id, request.correlation_id);
                    return DeliveryOutcome::Completed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::prepare_outbound;
    use bus::{BusEndpoint, MemoryEndpoint, MultiBus};
    use std::sync::Mutex;

    const REPLY_TOPIC: &str = "router-10.0.0.1-gw";

    #[derive(Default)]
    struct RecordingSink {
        forwarded: Mutex<Vec<Message>>,
    }

    impl RecordingSink {
        fn forwarded(&self) -> Vec<Message> {
            self.forwarded.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn forward(&self, response: &Message) -> Result<()> {
            self.forwarded.lock().unwrap().push(response.clone());
            Ok(())
        }
    }

    struct Harness {
        endpoint: Arc<MemoryEndpoint>,
        engine: Arc<Engine>,
        sink: Arc<RecordingSink>,
        ctx: DeliveryContext,
    }

    impl Harness {
        async fn new(policy: Arc<dyn TimeoutPolicy>) -> Self {
            let endpoint = Arc::new(MemoryEndpoint::new("mem://0"));
            let bus = MultiBus::new(vec![endpoint.clone() as Arc<dyn BusEndpoint>]).unwrap();
            let engine = Arc::new(Engine::new(Arc::new(bus), EngineConfig::new(REPLY_TOPIC)));
            engine.start().await.unwrap();

            let sink = Arc::new(RecordingSink::default());
            let ctx = DeliveryContext {
                session: Arc::new(SessionInfo::new("sess", "10.1.1.1")),
                sink: sink.clone(),
                cancel: CancellationToken::new(),
                timeout_policy: policy,
            };
            Self {
                endpoint,
                engine,
                sink,
                ctx,
            }
        }

        fn request(&self, id: &str) -> Message {
            let mut msg = Message {
                correlation_id: id.to_string(),
                routing: Some(RoutingStack {
                    route_to: vec![Route::new("microservice://echo")],
                    route_from: Vec::new(),
                }),
                ..Default::default()
            };
            prepare_outbound(&mut msg, &self.ctx.session).unwrap();
            msg
        }

        /// Reply the way a service would: to the tail of the request's route_from.
        fn reply(&self, request: &Message, body: &'static [u8], completed: bool) {
            let reply = Message {
                correlation_id: request.correlation_id.clone(),
                method: Method::Reply as i32,
                body: Bytes::from_static(body),
                routing: Some(RoutingStack {
                    route_to: vec![
                        Route::new("client://sess"),
                        Route::with_scheme(ROUTER_SCHEME, REPLY_TOPIC),
                    ],
                    route_from: vec![Route::new("microservice://echo")],
                }),
                completed,
                ..Default::default()
            };
            self.endpoint
                .inject(REPLY_TOPIC, Bytes::from(reply.encode_to_vec()));
        }
    }

    #[tokio::test]
    async fn test_route_publishes_to_destination_with_router_hop() {
        let h = Harness::new(Arc::new(SilentTimeout)).await;
        let _handle = h
            .engine
            .route(h.request("1"), DEFAULT_REQUEST_TIMEOUT)
            .await
            .unwrap();

        let published = h.endpoint.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "microservice://echo");

        let sent = Message::decode(published[0].1.clone()).unwrap();
        assert_eq!(sent.correlation_id, "sess::1");
        let hops: Vec<String> = sent.routing.unwrap().route_from.into_iter().map(|r| r.uri).collect();
        assert_eq!(hops, vec!["client://sess".to_string(), format!("router://{}", REPLY_TOPIC)]);
        assert_eq!(h.engine.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_streams_responses_in_order_until_completed() {
        let h = Harness::new(Arc::new(SilentTimeout)).await;
        let request = h.request("1");
        let handle = h.engine.route(request.clone(), DEFAULT_REQUEST_TIMEOUT).await.unwrap();

        h.reply(&request, b"a", false);
        h.reply(&request, b"b", false);
        h.reply(&request, b"c", true);
        h.reply(&request, b"late", true);

        let outcome = deliver(handle, &request, &h.ctx).await;
        assert_eq!(outcome, DeliveryOutcome::Completed);

        let forwarded = h.sink.forwarded();
        let bodies: Vec<&[u8]> = forwarded.iter().map(|m| m.body.as_ref()).collect();
        assert_eq!(bodies, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        for msg in &forwarded {
            assert_eq!(msg.correlation_id, "1");
            assert_eq!(msg.routing.as_ref().unwrap().route_to, vec![Route::new("client://sess")]);
        }
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_and_stops_forwarding() {
        let h = Harness::new(Arc::new(SilentTimeout)).await;
        let request = h.request("1");
        let handle = h
            .engine
            .route(request.clone(), Duration::from_millis(500))
            .await
            .unwrap();

        let outcome = deliver(handle, &request, &h.ctx).await;
        assert_eq!(outcome, DeliveryOutcome::TimedOut);
        assert_eq!(h.engine.pending_count(), 0);

        h.reply(&request, b"too late", true);
        assert!(h.sink.forwarded().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_stream_then_timeout() {
        let h = Harness::new(Arc::new(SilentTimeout)).await;
        let request = h.request("1");
        let handle = h
            .engine
            .route(request.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        h.reply(&request, b"a", false);

        let outcome = deliver(handle, &request, &h.ctx).await;
        assert_eq!(outcome, DeliveryOutcome::TimedOut);
        assert_eq!(h.sink.forwarded().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reply_policy_synthesizes_terminal_reply() {
        let h = Harness::new(Arc::new(ErrorReplyOnTimeout)).await;
        let request = h.request("42");
        let handle = h
            .engine
            .route(request.clone(), Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(deliver(handle, &request, &h.ctx).await, DeliveryOutcome::TimedOut);

        let forwarded = h.sink.forwarded();
        assert_eq!(forwarded.len(), 1);
        let reply = &forwarded[0];
        assert_eq!(reply.correlation_id, "42");
        assert!(reply.completed);
        assert_eq!(reply.resource(), Resource::Error);
        assert_eq!(reply.routing.as_ref().unwrap().route_to, request.routing.as_ref().unwrap().route_from);
    }

    #[tokio::test]
    async fn test_cancelled_session_abandons_and_releases() {
        let h = Harness::new(Arc::new(ErrorReplyOnTimeout)).await;
        let request = h.request("1");
        let handle = h.engine.route(request.clone(), DEFAULT_REQUEST_TIMEOUT).await.unwrap();

        h.reply(&request, b"a", false);
        h.ctx.cancel.cancel();

        let outcome = deliver(handle, &request, &h.ctx).await;
        assert_eq!(outcome, DeliveryOutcome::Abandoned);
        assert!(h.sink.forwarded().is_empty());
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_garbage_replies_are_dropped() {
        let h = Harness::new(Arc::new(SilentTimeout)).await;
        let stranger = h.request("nobody-waits");
        h.reply(&stranger, b"x", true);
        h.endpoint.inject(REPLY_TOPIC, Bytes::from_static(b"\xff\xff\xff"));

        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_and_releases() {
        let h = Harness::new(Arc::new(SilentTimeout)).await;
        h.endpoint.set_fail_publish(true);

        let result = h.engine.route(h.request("1"), DEFAULT_REQUEST_TIMEOUT).await;
        assert!(matches!(result, Err(GatewayError::Bus(_))));
        assert_eq!(h.engine.pending_count(), 0);

        let outcome = h.engine.stream(h.request("2"), &h.ctx).await;
        assert_eq!(outcome, DeliveryOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_route_requires_destination() {
        let h = Harness::new(Arc::new(SilentTimeout)).await;
        let result = h.engine.route(Message::default(), DEFAULT_REQUEST_TIMEOUT).await;

        assert!(matches!(result, Err(GatewayError::NoDestination)));
        assert_eq!(h.endpoint.publish_attempts(), 0);
    }
}

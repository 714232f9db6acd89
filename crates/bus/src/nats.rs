//! NATS endpoint implementation using NATS Core (low-latency push).

use crate::endpoint::{BusEndpoint, Dialer, MessageHandler};
use crate::error::{BusError, Result};
use async_nats::{Client, ConnectOptions, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, SelectAll, StreamExt};
use metrics::counter;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default liveness interval for broker connections (7 seconds).
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(7);

type HandlerStream = stream::BoxStream<'static, (Bytes, MessageHandler)>;

/// Dialer that connects NATS endpoints.
#[derive(Debug, Clone)]
pub struct NatsDialer {
    /// Connection name reported to the server.
    name: String,
    /// Client ping interval; governs connection liveness.
    heartbeat: Duration,
    /// Queue group shared by every subscription of the dialed endpoints.
    queue_group: Option<String>,
}

impl NatsDialer {
    /// Create a dialer with the given connection name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            heartbeat: DEFAULT_HEARTBEAT,
            queue_group: None,
        }
    }

    /// Set the connection heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Subscribe through a queue group.
    ///
    /// Endpoints that are nodes of one cluster then deliver each message to a single
    /// member of the group instead of once per connection.
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }
}

#[async_trait]
impl Dialer for NatsDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn BusEndpoint>> {
        let endpoint = NatsEndpoint::connect(
            address,
            &self.name,
            self.heartbeat,
            self.queue_group.clone(),
        )
        .await?;
        Ok(Arc::new(endpoint))
    }
}

/// Hands subscriptions to the consumption loop, including ones opened while it runs.
struct SubscriptionFeed {
    address: String,
    tx: mpsc::UnboundedSender<HandlerStream>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<HandlerStream>>>,
}

impl SubscriptionFeed {
    fn new(address: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            address: address.to_string(),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Fails once the consumption loop has stopped.
    fn push(&self, stream: HandlerStream) -> Result<()> {
        self.tx.send(stream).map_err(|_| BusError::Subscribe {
            address: self.address.clone(),
            source: "consumption loop has stopped".into(),
        })
    }

    fn take(&self) -> Result<mpsc::UnboundedReceiver<HandlerStream>> {
        self.rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| BusError::AlreadyRunning(self.address.clone()))
    }
}

/// Dispatch every message of every subscription until all subscriptions have ended.
async fn consume(address: &str, mut rx: mpsc::UnboundedReceiver<HandlerStream>) {
    let mut streams: SelectAll<HandlerStream> = SelectAll::new();
    while let Ok(stream) = rx.try_recv() {
        streams.push(stream);
    }

    info!("Consuming {} subscriptions on {}", streams.len(), address);

    loop {
        tokio::select! {
            next = streams.next(), if !streams.is_empty() => match next {
                Some((payload, handler)) => {
                    counter!("bus_messages_received_total", "endpoint" => address.to_string()).increment(1);
                    handler(payload);
                }
                None => break,
            },
            Some(stream) = rx.recv() => {
                debug!("Late subscription joined consumption on {}", address);
                streams.push(stream);
            }
            else => break,
        }
    }

    warn!("All subscriptions ended on {}", address);
}

/// A single NATS connection.
///
/// Subscriptions are opened eagerly and consumed by [`BusEndpoint::run`]; subscriptions
/// added while `run` is active join the running loop. `run` returns once every
/// subscription it consumed has ended, after which `subscribe` fails.
pub struct NatsEndpoint {
    address: String,
    client: Client,
    queue_group: Option<String>,
    feed: SubscriptionFeed,
}

impl NatsEndpoint {
    /// Connect to a NATS server.
    pub async fn connect(
        address: &str,
        name: &str,
        heartbeat: Duration,
        queue_group: Option<String>,
    ) -> Result<Self> {
        info!("Connecting to NATS at {}", address);
        let client = ConnectOptions::new()
            .name(name)
            .ping_interval(heartbeat)
            .connect(address)
            .await
            .map_err(|e| BusError::Connect {
                address: address.to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            address: address.to_string(),
            client,
            queue_group,
            feed: SubscriptionFeed::new(address),
        })
    }

    fn handler_stream(subscriber: Subscriber, handler: MessageHandler) -> HandlerStream {
        subscriber
            .map(move |msg| (msg.payload, handler.clone()))
            .boxed()
    }
}

#[async_trait]
impl BusEndpoint for NatsEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish {
                address: self.address.clone(),
                source: Box::new(e),
            })
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let subscribed = match &self.queue_group {
            Some(group) => {
                info!(
                    "Subscribing to '{}' in group '{}' on {}",
                    topic, group, self.address
                );
                self.client
                    .queue_subscribe(topic.to_string(), group.clone())
                    .await
            }
            None => {
                info!("Subscribing to '{}' on {}", topic, self.address);
                self.client.subscribe(topic.to_string()).await
            }
        };
        let subscriber = subscribed.map_err(|e| BusError::Subscribe {
            address: self.address.clone(),
            source: Box::new(e),
        })?;

        self.feed.push(Self::handler_stream(subscriber, handler))
    }

    async fn run(&self) -> Result<()> {
        let rx = self.feed.take()?;
        consume(&self.address, rx).await;
        Ok(())
    }
}

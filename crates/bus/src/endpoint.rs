//! Endpoint and dialer traits.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Callback invoked for every message consumed on a subscribed topic.
///
/// Handlers run on the endpoint's consumption task and must not block.
pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A single broker connection.
#[async_trait]
pub trait BusEndpoint: Send + Sync {
    /// Broker address this endpoint is connected to.
    fn address(&self) -> &str;

    /// Publish a payload on a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Register a handler for a topic.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()>;

    /// Consume subscribed topics until every subscription has ended.
    async fn run(&self) -> Result<()>;
}

/// Establishes endpoint connections by address.
///
/// Reconnection of an established endpoint is the dialer's concern.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to the broker at `address`.
    async fn dial(&self, address: &str) -> Result<Arc<dyn BusEndpoint>>;
}

//! Multi-endpoint bus: round-robin publish, fan-in subscribe.

use crate::endpoint::{BusEndpoint, MessageHandler};
use crate::error::{BusError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use metrics::counter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Publish/subscribe capability consumed by the request engine.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload on a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Register a handler for a topic.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()>;
}

/// Bus spread over several independent broker endpoints.
///
/// Publishing rotates through the endpoints with a shared offset. The offset advances on
/// every call whether or not the publish succeeded, and a failed publish is returned to
/// the caller rather than retried elsewhere.
///
/// Subscribing registers the topic on every endpoint, so a message routed through any
/// broker reaches the handler.
pub struct MultiBus {
    endpoints: Vec<Arc<dyn BusEndpoint>>,
    offset: AtomicUsize,
}

impl MultiBus {
    /// Create a bus over at least one endpoint.
    pub fn new(endpoints: Vec<Arc<dyn BusEndpoint>>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(BusError::NoEndpoints);
        }
        Ok(Self {
            endpoints,
            offset: AtomicUsize::new(0),
        })
    }

    /// Number of endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Run every endpoint's consumption loop until all of them have returned.
    ///
    /// A failing endpoint does not stop the others; the first error is reported once
    /// every loop is done.
    pub async fn run(&self) -> Result<()> {
        info!("Running {} bus endpoints", self.endpoints.len());

        let results = join_all(self.endpoints.iter().map(|endpoint| async move {
            let result = endpoint.run().await;
            if let Err(e) = &result {
                error!("Bus endpoint {} stopped: {}", endpoint.address(), e);
            }
            result
        }))
        .await;

        info!("All bus endpoints stopped");
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    fn next_endpoint(&self) -> &Arc<dyn BusEndpoint> {
        let index = self.offset.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[index]
    }
}

#[async_trait]
impl Bus for MultiBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let endpoint = self.next_endpoint();
        let address = endpoint.address().to_string();

        counter!("bus_publish_total", "endpoint" => address.clone()).increment(1);
        let result = endpoint.publish(topic, payload).await;
        if result.is_err() {
            counter!("bus_publish_errors_total", "endpoint" => address.clone()).increment(1);
        }
        debug!("Published on '{}' via {}", topic, address);
        result
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        for endpoint in &self.endpoints {
            endpoint.subscribe(topic, handler.clone()).await?;
        }
        Ok(())
    }
}

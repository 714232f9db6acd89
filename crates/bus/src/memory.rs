//! In-process endpoint.
//!
//! Delivers published payloads to handlers subscribed on the same endpoint, the way a
//! single broker would. Used for local runs without a broker and as a test double.

use crate::endpoint::{BusEndpoint, Dialer, MessageHandler};
use crate::error::{BusError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// Loopback endpoint backed by in-memory handler tables.
pub struct MemoryEndpoint {
    address: String,
    handlers: Mutex<HashMap<String, Vec<MessageHandler>>>,
    published: Mutex<Vec<(String, Bytes)>>,
    publish_attempts: AtomicUsize,
    fail_publish: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl MemoryEndpoint {
    /// Create an endpoint identified by `address`.
    pub fn new(address: impl Into<String>) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            address: address.into(),
            handlers: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            publish_attempts: AtomicUsize::new(0),
            fail_publish: AtomicBool::new(false),
            stopped,
        }
    }

    /// Make subsequent publishes fail (or succeed again).
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Deliver a payload to this endpoint's handlers for `topic`, as if it had been
    /// routed here by the broker. Returns how many handlers received it.
    pub fn inject(&self, topic: &str, payload: Bytes) -> usize {
        let handlers = match self.handlers.lock() {
            Ok(table) => table.get(topic).cloned().unwrap_or_default(),
            Err(_) => return 0,
        };
        for handler in &handlers {
            handler(payload.clone());
        }
        handlers.len()
    }

    /// Number of publish calls, successful or not.
    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Successfully published `(topic, payload)` pairs, in order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    /// Number of handlers registered for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers
            .lock()
            .map(|table| table.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Stop the consumption loop started by [`BusEndpoint::run`].
    pub fn stop(&self) {
        self.stopped.send_replace(true);
    }
}

#[async_trait]
impl BusEndpoint for MemoryEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                address: self.address.clone(),
                source: "publish rejected".into(),
            });
        }

        if let Ok(mut published) = self.published.lock() {
            published.push((topic.to_string(), payload.clone()));
        }
        let delivered = self.inject(topic, payload);
        debug!(
            "Published on {} topic '{}' ({} handlers)",
            self.address, topic, delivered
        );
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let mut table = self.handlers.lock().map_err(|_| BusError::Subscribe {
            address: self.address.clone(),
            source: "handler table poisoned".into(),
        })?;
        table.entry(topic.to_string()).or_default().push(handler);
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let mut stopped = self.stopped.subscribe();
        // Sender is owned by `self`, so `wait_for` only errors during teardown.
        let _ = stopped.wait_for(|stopped| *stopped).await;
        Ok(())
    }
}

/// Dialer handing out [`MemoryEndpoint`]s, one per address.
#[derive(Default)]
pub struct MemoryDialer {
    endpoints: DashMap<String, Arc<MemoryEndpoint>>,
    dials: AtomicUsize,
}

impl MemoryDialer {
    /// Create an empty dialer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of dial calls.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn BusEndpoint>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if address.is_empty() {
            return Err(BusError::Connect {
                address: address.to_string(),
                source: "empty address".into(),
            });
        }
        let endpoint = self
            .endpoints
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(MemoryEndpoint::new(address)))
            .clone();
        Ok(endpoint)
    }
}

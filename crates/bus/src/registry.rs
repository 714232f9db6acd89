//! Per-address endpoint cache.
//!
//! Each distinct address is dialed at most once, even when several tasks ask for it
//! concurrently. A failed dial leaves the slot empty so the next caller retries.

use crate::endpoint::{BusEndpoint, Dialer};
use crate::error::{BusError, Result};
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

type Slot = Arc<OnceCell<Arc<dyn BusEndpoint>>>;

/// Caching front for a [`Dialer`].
pub struct DialerRegistry<D: Dialer> {
    dialer: D,
    endpoints: DashMap<String, Slot>,
}

impl<D: Dialer> DialerRegistry<D> {
    /// Create an empty registry around `dialer`.
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            endpoints: DashMap::new(),
        }
    }

    /// The wrapped dialer.
    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Return the live endpoint for `address`, dialing it on first use.
    pub async fn get_or_dial(&self, address: &str) -> Result<Arc<dyn BusEndpoint>> {
        // Clone the slot out so the map shard is not locked across the dial.
        let slot = self
            .endpoints
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        slot.get_or_try_init(|| self.dialer.dial(address))
            .await
            .cloned()
    }

    /// Dial every distinct address concurrently.
    ///
    /// Unreachable addresses are logged and skipped. Fails with
    /// [`BusError::NoEndpoints`] when nothing could be reached.
    pub async fn connect_all(&self, addresses: &[String]) -> Result<Vec<Arc<dyn BusEndpoint>>> {
        let mut seen = HashSet::new();
        let distinct: Vec<&str> = addresses
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty() && seen.insert(*a))
            .collect();

        let results = join_all(distinct.iter().map(|address| self.get_or_dial(address))).await;

        let mut endpoints = Vec::with_capacity(results.len());
        for (address, result) in distinct.iter().zip(results) {
            match result {
                Ok(endpoint) => {
                    info!("Bus endpoint {} ready", address);
                    endpoints.push(endpoint);
                }
                Err(e) => warn!("Skipping bus endpoint {}: {}", address, e),
            }
        }

        if endpoints.is_empty() {
            return Err(BusError::NoEndpoints);
        }
        Ok(endpoints)
    }

    /// Number of addresses with a live endpoint.
    pub fn connected_count(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|slot| slot.value().initialized())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDialer, MemoryEndpoint};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Dialer that is slow to connect and fails the first `failures` attempts.
    struct SlowDialer {
        dials: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl Dialer for SlowDialer {
        async fn dial(&self, address: &str) -> Result<Arc<dyn BusEndpoint>> {
            let attempt = self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if attempt < self.failures {
                return Err(BusError::Connect {
                    address: address.to_string(),
                    source: "refused".into(),
                });
            }
            Ok(Arc::new(MemoryEndpoint::new(address)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_use_dials_once() {
        let registry = Arc::new(DialerRegistry::new(SlowDialer {
            dials: AtomicUsize::new(0),
            failures: 0,
        }));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_dial("nats://a:4222").await })
            })
            .collect();

        let mut endpoints = Vec::new();
        for task in tasks {
            endpoints.push(task.await.unwrap().unwrap());
        }

        assert_eq!(registry.dialer().dials.load(Ordering::SeqCst), 1);
        assert!(endpoints.iter().all(|e| Arc::ptr_eq(e, &endpoints[0])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dial_is_retried() {
        let registry = DialerRegistry::new(SlowDialer {
            dials: AtomicUsize::new(0),
            failures: 1,
        });

        assert!(registry.get_or_dial("nats://a:4222").await.is_err());
        assert_eq!(registry.connected_count(), 0);
        assert!(registry.get_or_dial("nats://a:4222").await.is_ok());
        assert_eq!(registry.dialer().dials.load(Ordering::SeqCst), 2);
        assert_eq!(registry.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_all_dedupes_and_skips_failures() {
        let registry = DialerRegistry::new(MemoryDialer::new());
        let addresses = vec![
            "mem://a".to_string(),
            " mem://b ".to_string(),
            "mem://a".to_string(),
            "".to_string(),
        ];

        let endpoints = registry.connect_all(&addresses).await.unwrap();
        let names: Vec<&str> = endpoints.iter().map(|e| e.address()).collect();
        assert_eq!(names, vec!["mem://a", "mem://b"]);
        assert_eq!(registry.dialer().dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_without_reachable_endpoint_fails() {
        let registry = DialerRegistry::new(SlowDialer {
            dials: AtomicUsize::new(0),
            failures: usize::MAX,
        });

        let result = registry
            .connect_all(&["nats://a:4222".to_string(), "nats://b:4222".to_string()])
            .await;
        assert!(matches!(result, Err(BusError::NoEndpoints)));
    }
}

//! Synthetic health check: route one message through the fabric and wait for completion.

use crate::codec::decode_hex_message;
use crate::engine::Engine;
use crate::error::{GatewayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Local deadline for a health check, shorter than the request timeout.
pub const HEALTH_CHECK_DEADLINE: Duration = Duration::from_secs(1);

/// Result of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    TimedOut,
}

pub struct HealthCheck {
    engine: Arc<Engine>,
}

impl HealthCheck {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Route a hex-encoded health message and report whether it completed in time.
    ///
    /// Only an undecodable payload is an error. Anything that prevents a completed
    /// reply from arriving before the deadline is [`HealthOutcome::TimedOut`].
    pub async fn check(&self, payload_hex: &str) -> Result<HealthOutcome> {
        let mut msg =
            decode_hex_message(payload_hex).map_err(|e| GatewayError::Decode(e.to_string()))?;
        msg.correlation_id = Uuid::new_v4().to_string();
        let correlation_id = msg.correlation_id.clone();

        let mut handle = match self.engine.route(msg, self.engine.request_timeout()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Health check {} not routed: {}", correlation_id, e);
                return Ok(HealthOutcome::TimedOut);
            }
        };

        let deadline = tokio::time::sleep(HEALTH_CHECK_DEADLINE);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = &mut handle.timeout => break,
                next = handle.responses.recv() => match next {
                    Some(response) if response.completed => {
                        debug!("Health check {} completed", correlation_id);
                        return Ok(HealthOutcome::Healthy);
                    }
                    Some(_) => continue,
                    None => break,
                },
            }
        }

        warn!("Health check {} timed out", correlation_id);
        Ok(HealthOutcome::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_hex_message;
    use crate::engine::EngineConfig;
    use crate::protocol::{Message, Method, Resource, Route, RoutingStack};
    use bus::{BusEndpoint, MemoryEndpoint, MultiBus};
    use bytes::Bytes;
    use prost::Message as _;

    const REPLY_TOPIC: &str = "router-health";

    async fn setup() -> (Arc<MemoryEndpoint>, HealthCheck) {
        let endpoint = Arc::new(MemoryEndpoint::new("mem://0"));
        let bus = MultiBus::new(vec![endpoint.clone() as Arc<dyn BusEndpoint>]).unwrap();
        let engine = Arc::new(Engine::new(Arc::new(bus), EngineConfig::new(REPLY_TOPIC)));
        engine.start().await.unwrap();
        (endpoint, HealthCheck::new(engine))
    }

    fn health_payload() -> String {
        encode_hex_message(&Message {
            method: Method::Get as i32,
            resource: Resource::Health as i32,
            routing: Some(RoutingStack {
                route_to: vec![Route::new("microservice://health")],
                route_from: Vec::new(),
            }),
            ..Default::default()
        })
    }

    /// Answers every message published on the health topic.
    async fn install_responder(endpoint: Arc<MemoryEndpoint>, completed: bool) {
        let replier = endpoint.clone();
        endpoint
            .subscribe(
                "microservice://health",
                Arc::new(move |payload| {
                    let request = Message::decode(payload).unwrap();
                    let reply = Message {
                        correlation_id: request.correlation_id,
                        method: Method::Reply as i32,
                        completed,
                        ..Default::default()
                    };
                    replier.inject(REPLY_TOPIC, Bytes::from(reply.encode_to_vec()));
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_healthy_when_completed_reply_arrives() {
        let (endpoint, health) = setup().await;
        install_responder(endpoint.clone(), true).await;

        let outcome = health.check(&health_payload()).await.unwrap();
        assert_eq!(outcome, HealthOutcome::Healthy);

        let sent = Message::decode(endpoint.published()[0].1.clone()).unwrap();
        assert!(Uuid::parse_str(&sent.correlation_id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_local_deadline() {
        let (_endpoint, health) = setup().await;

        let started = tokio::time::Instant::now();
        let outcome = health.check(&health_payload()).await.unwrap();

        assert_eq!(outcome, HealthOutcome::TimedOut);
        assert!(started.elapsed() >= HEALTH_CHECK_DEADLINE);
        assert!(started.elapsed() < crate::engine::DEFAULT_REQUEST_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_replies_do_not_count() {
        let (endpoint, health) = setup().await;
        install_responder(endpoint, false).await;

        let outcome = health.check(&health_payload()).await.unwrap();
        assert_eq!(outcome, HealthOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_an_error() {
        let (endpoint, health) = setup().await;

        assert!(matches!(health.check("xyz").await, Err(GatewayError::Decode(_))));
        assert_eq!(endpoint.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn test_empty_payload_times_out_without_publishing() {
        let (endpoint, health) = setup().await;

        assert_eq!(health.check("").await.unwrap(), HealthOutcome::TimedOut);
        assert_eq!(endpoint.publish_attempts(), 0);
    }
}

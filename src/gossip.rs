/// Gossip Service Module
///
/// Topic-addressed pub/sub on top of the swarm's gossipsub behaviour. All
/// messages are signed by the transport (`MessageAuthenticity::Signed`) and
/// strictly validated before they ever reach this layer; on top of that the
/// service wraps every payload in an envelope stamping the sender and a
/// publish timestamp, so receivers can observe propagation latency.
///
/// Handlers are registered per topic. A malformed envelope increments the
/// validation-failure counter and is dropped; a handler error is logged and
/// does not stop dispatch to the remaining handlers.
use chrono::Utc;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::MeshResult;
use crate::monitoring::MeshMetrics;
use crate::network_actor::{GossipEvent, NetworkHandle};

/// Envelope wrapped around every gossip payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipEnvelope {
    /// Peer id of the publisher
    pub sender: String,
    /// Publish time in unix milliseconds
    pub timestamp_ms: i64,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Tag dispatching the payload to a typed handler; unknown tags are
    /// delivered raw
    pub payload_type: String,
}

/// A received, validated gossip message.
#[derive(Debug, Clone)]
pub struct GossipMessage {
    pub topic: String,
    pub sender: String,
    pub timestamp_ms: i64,
    pub payload: Vec<u8>,
    pub payload_type: String,
}

/// Per-topic message callback. Errors are logged, never fatal.
pub type GossipHandler = Arc<dyn Fn(GossipMessage) -> MeshResult<()> + Send + Sync>;

/// Signed topic pub/sub with per-topic handler dispatch.
pub struct GossipService {
    handle: NetworkHandle,
    local_peer_id: PeerId,
    handlers: Arc<RwLock<HashMap<String, Vec<GossipHandler>>>>,
    metrics: Arc<MeshMetrics>,
}

impl GossipService {
    pub fn new(handle: NetworkHandle, metrics: Arc<MeshMetrics>) -> Self {
        let local_peer_id = handle.local_peer_id();
        Self {
            handle,
            local_peer_id,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            metrics,
        }
    }

    /// Register a handler for a topic, subscribing on first registration.
    pub async fn subscribe(&self, topic: &str, handler: GossipHandler) -> MeshResult<()> {
        let mut handlers = self.handlers.write().await;
        let entry = handlers.entry(topic.to_string()).or_default();
        let first = entry.is_empty();
        entry.push(handler);
        drop(handlers);

        if first {
            self.handle.subscribe(topic.to_string()).await?;
            debug!("subscribed to {}", topic);
        }
        Ok(())
    }

    /// Drop all handlers for a topic and leave it.
    pub async fn unsubscribe(&self, topic: &str) -> MeshResult<()> {
        self.handlers.write().await.remove(topic);
        self.handle.unsubscribe(topic.to_string()).await
    }

    /// Publish a payload on a topic, stamping sender and timestamp.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        payload_type: &str,
    ) -> MeshResult<()> {
        let envelope = GossipEnvelope {
            sender: self.local_peer_id.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            payload,
            payload_type: payload_type.to_string(),
        };
        let data = serde_json::to_vec(&envelope)?;
        self.handle.publish_gossip(topic.to_string(), data).await?;
        MeshMetrics::incr(&self.metrics.gossip_published);
        Ok(())
    }

    /// Spawn the dispatch loop over raw gossip events from the actor.
    pub fn spawn_dispatcher(
        &self,
        mut events: mpsc::UnboundedReceiver<GossipEvent>,
    ) -> JoinHandle<()> {
        let handlers = Arc::clone(&self.handlers);
        let metrics = Arc::clone(&self.metrics);
        let local_peer_id = self.local_peer_id;

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                // Our own messages are not re-delivered.
                if event.source == Some(local_peer_id) {
                    continue;
                }
                MeshMetrics::incr(&metrics.gossip_received);

                let envelope: GossipEnvelope = match serde_json::from_slice(&event.data) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("malformed gossip payload on {}: {}", event.topic, e);
                        MeshMetrics::incr(&metrics.gossip_validation_failures);
                        continue;
                    }
                };

                let age_ms = Utc::now().timestamp_millis() - envelope.timestamp_ms;
                if age_ms >= 0 {
                    metrics.observe_gossip_latency(Duration::from_millis(age_ms as u64));
                }

                let message = GossipMessage {
                    topic: event.topic.clone(),
                    sender: envelope.sender,
                    timestamp_ms: envelope.timestamp_ms,
                    payload: envelope.payload,
                    payload_type: envelope.payload_type,
                };

                let topic_handlers = {
                    let handlers = handlers.read().await;
                    handlers.get(&event.topic).cloned().unwrap_or_default()
                };
                if topic_handlers.is_empty() {
                    debug!("no handlers for topic {}", event.topic);
                    continue;
                }
                for handler in topic_handlers {
                    if let Err(e) = handler(message.clone()) {
                        warn!("gossip handler on {} failed: {}", event.topic, e);
                    }
                }
            }
            debug!("gossip dispatcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = GossipEnvelope {
            sender: "12D3KooWExample".to_string(),
            timestamp_ms: 1_700_000_000_000,
            payload: b"descriptor update".to_vec(),
            payload_type: "descriptor-update".to_string(),
        };

        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: GossipEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.sender, envelope.sender);
        assert_eq!(decoded.payload, envelope.payload);
        assert_eq!(decoded.payload_type, envelope.payload_type);
    }

    #[test]
    fn test_malformed_envelope_fails_to_parse() {
        let result: Result<GossipEnvelope, _> = serde_json::from_slice(b"{not json");
        assert!(result.is_err());
    }
}

/// Message Bus Module
///
/// Typed agent-to-agent messaging layered on one well-known gossip topic.
/// Every outbound message gets a fresh unique id; request/response pairs
/// are correlated by `correlation_id = request.id`, and a pending-response
/// slot per request id lets `send_request` wait for exactly its own answer.
///
/// Delivery modes: best-effort does nothing extra; at-least-once and
/// exactly-once cause the receiver to emit a best-effort ack, and
/// exactly-once additionally suppresses redelivery through a seen-recently
/// cache with ten-minute retention.
use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MeshError, MeshResult};
use crate::monitoring::MeshMetrics;

/// How long exactly-once message ids are remembered
const SEEN_RETENTION: Duration = Duration::from_secs(10 * 60);
/// Upper bound on remembered message ids
const SEEN_CAPACITY: usize = 8192;
/// Cadence of the seen-cache sweep
const SEEN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Kinds of agent messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Broadcast,
    Negotiation,
    Coordination,
    Heartbeat,
    Ack,
}

/// Delivery guarantees for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    BestEffort,
    AtLeastOnce,
    ExactlyOnce,
}

/// Agent message envelope, JSON on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub delivery: DeliveryMode,
    pub from: String,
    /// Empty means broadcast
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub reply_to: String,
    pub timestamp: i64,
    pub ttl_seconds: u64,
    pub payload: Vec<u8>,
    pub payload_type: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentMessage {
    fn expired(&self, now: i64) -> bool {
        self.ttl_seconds > 0 && now - self.timestamp > self.ttl_seconds as i64
    }
}

/// Where outbound bus messages go. Production publishes on the agent
/// messages gossip topic; tests loop back in memory.
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn publish(&self, message: &AgentMessage) -> MeshResult<()>;
}

/// Per-message-type callback. Errors are logged, never fatal.
pub type BusHandler = Arc<dyn Fn(AgentMessage) -> MeshResult<()> + Send + Sync>;

/// Typed request/response/broadcast messaging for agents.
pub struct MessageBus {
    local_peer_id: String,
    transport: Arc<dyn BusTransport>,
    default_ttl: u64,
    pending: Mutex<HashMap<String, oneshot::Sender<AgentMessage>>>,
    handlers: RwLock<HashMap<MessageType, Vec<BusHandler>>>,
    seen: Mutex<LruCache<String, Instant>>,
    metrics: Arc<MeshMetrics>,
}

impl MessageBus {
    pub fn new(
        local_peer_id: String,
        transport: Arc<dyn BusTransport>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            local_peer_id,
            transport,
            default_ttl: 60,
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_CAPACITY).expect("capacity is non-zero"),
            )),
            metrics,
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Register a handler for a message type.
    pub async fn register_handler(&self, message_type: MessageType, handler: BusHandler) {
        self.handlers
            .write()
            .await
            .entry(message_type)
            .or_default()
            .push(handler);
    }

    fn base_message(
        &self,
        message_type: MessageType,
        delivery: DeliveryMode,
        payload: Vec<u8>,
        payload_type: &str,
    ) -> AgentMessage {
        AgentMessage {
            id: Uuid::new_v4().to_string(),
            correlation_id: String::new(),
            message_type,
            delivery,
            from: self.local_peer_id.clone(),
            to: String::new(),
            reply_to: String::new(),
            timestamp: Utc::now().timestamp(),
            ttl_seconds: self.default_ttl,
            payload,
            payload_type: payload_type.to_string(),
            metadata: HashMap::new(),
        }
    }

    /// Publish an already-built message.
    pub async fn send_message(&self, message: &AgentMessage) -> MeshResult<()> {
        self.transport.publish(message).await
    }

    /// Send a request and wait for the matching response.
    pub async fn send_request(
        &self,
        to: &str,
        payload: Vec<u8>,
        payload_type: &str,
        timeout: Duration,
    ) -> MeshResult<AgentMessage> {
        let mut request =
            self.base_message(MessageType::Request, DeliveryMode::AtLeastOnce, payload, payload_type);
        request.to = to.to_string();
        request.reply_to = self.local_peer_id.clone();

        let (response_tx, response_rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(request.id.clone(), response_tx);

        if let Err(e) = self.transport.publish(&request).await {
            self.pending.lock().await.remove(&request.id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&request.id);
                Err(MeshError::Cancelled("response slot dropped".to_string()))
            }
            Err(_) => {
                self.pending.lock().await.remove(&request.id);
                Err(MeshError::DeadlineExceeded(format!(
                    "no response to {} within {:?}",
                    request.id, timeout
                )))
            }
        }
    }

    /// Respond to a received request.
    pub async fn send_response(
        &self,
        original: &AgentMessage,
        payload: Vec<u8>,
        payload_type: &str,
    ) -> MeshResult<()> {
        let mut response = self.base_message(
            MessageType::Response,
            DeliveryMode::BestEffort,
            payload,
            payload_type,
        );
        response.correlation_id = original.id.clone();
        response.to = original.from.clone();
        self.transport.publish(&response).await
    }

    /// Broadcast to every listening agent.
    pub async fn broadcast(
        &self,
        message_type: MessageType,
        delivery: DeliveryMode,
        payload: Vec<u8>,
        payload_type: &str,
    ) -> MeshResult<()> {
        let message = self.base_message(message_type, delivery, payload, payload_type);
        self.transport.publish(&message).await
    }

    /// Process one inbound message through the filter/dedup/dispatch chain.
    pub async fn handle_incoming(&self, message: AgentMessage) {
        // Own messages come back through gossip; ignore them.
        if message.from == self.local_peer_id {
            return;
        }
        // Addressed to someone else.
        if !message.to.is_empty() && message.to != self.local_peer_id {
            return;
        }
        let now = Utc::now().timestamp();
        if message.expired(now) {
            debug!("dropping expired message {}", message.id);
            MeshMetrics::incr(&self.metrics.messages_dropped);
            return;
        }

        if message.delivery == DeliveryMode::ExactlyOnce {
            let mut seen = self.seen.lock().await;
            if seen.contains(&message.id) {
                debug!("suppressing duplicate {}", message.id);
                MeshMetrics::incr(&self.metrics.messages_dropped);
                return;
            }
            seen.put(message.id.clone(), Instant::now());
        }

        let needs_ack = matches!(
            message.delivery,
            DeliveryMode::AtLeastOnce | DeliveryMode::ExactlyOnce
        ) && message.message_type != MessageType::Ack;

        // A response first tries to complete the request waiting on it.
        let mut consumed = false;
        if message.message_type == MessageType::Response && !message.correlation_id.is_empty() {
            if let Some(slot) = self.pending.lock().await.remove(&message.correlation_id) {
                consumed = slot.send(message.clone()).is_ok();
            } else {
                debug!("stale response {} discarded", message.id);
            }
        }

        if !consumed {
            let handlers = {
                let handlers = self.handlers.read().await;
                handlers.get(&message.message_type).cloned().unwrap_or_default()
            };
            for handler in handlers {
                if let Err(e) = handler(message.clone()) {
                    warn!("bus handler for {:?} failed: {}", message.message_type, e);
                }
            }
        }
        MeshMetrics::incr(&self.metrics.messages_delivered);

        if needs_ack {
            let mut ack = self.base_message(
                MessageType::Ack,
                DeliveryMode::BestEffort,
                Vec::new(),
                "ack",
            );
            ack.correlation_id = message.id.clone();
            ack.to = message.from.clone();
            if self.transport.publish(&ack).await.is_ok() {
                MeshMetrics::incr(&self.metrics.acks_sent);
            }
        }
    }

    /// Spawn the inbound pump feeding `handle_incoming`.
    pub fn spawn_receiver(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<AgentMessage>,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                bus.handle_incoming(message).await;
            }
            debug!("message bus receiver stopped");
        })
    }

    /// Spawn the seen-cache sweep; stops when `shutdown` flips.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SEEN_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut seen = bus.seen.lock().await;
                        let cutoff = Instant::now() - SEEN_RETENTION;
                        let expired: Vec<String> = seen
                            .iter()
                            .filter(|(_, at)| **at < cutoff)
                            .map(|(id, _)| id.clone())
                            .collect();
                        for id in expired {
                            seen.pop(&id);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

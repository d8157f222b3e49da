// ===================================================================================================
// Node Module - Lifecycle and Wiring of the AgentMesh Networking Core
// ===================================================================================================
//
// A Node owns every subsystem and wires them together in construction order:
//
//   transport/swarm -> network actor -> flow controller -> bandwidth QoS -> gossip ->
//   connection pool -> health monitor -> request deduplicator -> message bus ->
//   content-exchange handler -> q-routing messenger -> optional provider refresher
//
// and exposes the two end-to-end operations of the marketplace core:
//
//   publish(descriptor bytes) -> CID string
//       hash -> DHT provide -> local store -> track for republish
//
//   resolve(cid) -> bytes
//       local store hit? return. Else find providers (10 s, up to 5) -> QTable picks one ->
//       pooled content-exchange stream -> verify hash -> store -> feed latency/success back
//       into the QTable. Fetch errors feed back negatively and surface to the caller; there
//       is no automatic failover across candidates.
//
// `close` unwinds in reverse construction order; partial shutdown failures are logged and do
// not short-circuit the remaining cleanup.

use async_trait::async_trait;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use rand::seq::SliceRandom;
use sha2::Digest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::StreamExt;

use crate::bandwidth::BandwidthQoS;
use crate::config::MeshConfig;
use crate::connection_pool::{ConnectionPool, MeshStream, StreamFactory};
use crate::content_exchange;
use crate::content_id::{compute_cid, parse_cid, ContentId};
use crate::content_store::{ContentStore, MemoryContentStore};
use crate::content_verifier::ContentVerifier;
use crate::descriptor::{DescriptorValidator, SignedDescriptor};
use crate::error::{MeshError, MeshResult};
use crate::flow_control::FlowController;
use crate::gossip::GossipService;
use crate::health_monitor::{ConnectivityProbe, HealthMonitor};
use crate::message_bus::{AgentMessage, BusTransport, MessageBus};
use crate::monitoring::MeshMetrics;
use crate::network::build_swarm;
use crate::network_actor::{NetworkActor, NetworkHandle};
use crate::protocol::{Handshake, ProtocolNegotiator};
use crate::provider_refresher::{ProvideBackend, ProviderRefresher};
use crate::qrouting::QRoutingMessenger;
use crate::qtable::QTable;
use crate::request_dedup::RequestDeduplicator;
use crate::vector_clock::{DescriptorUpdate, UpdateHistory, VectorClock};

/// Poll cadence of `wait_for_peers`
const PEER_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Per-attempt deadline for a content-exchange fetch
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
/// Cap on handshake payloads
const MAX_HANDSHAKE_SIZE: usize = 4096;

/// Payload type tag of agent messages on the gossip layer
const AGENT_MESSAGE_TAG: &str = "agent-message";
/// Payload type tag of descriptor updates on the gossip layer
const DESCRIPTOR_UPDATE_TAG: &str = "descriptor-update";

/// Stream factory backed by the swarm's stream control.
struct ControlStreamFactory {
    control: libp2p_stream::Control,
}

#[async_trait]
impl StreamFactory for ControlStreamFactory {
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> MeshResult<MeshStream> {
        let protocol = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|e| MeshError::BadRequest(format!("protocol id: {}", e)))?;
        let mut control = self.control.clone();
        let stream = control
            .open_stream(peer, protocol)
            .await
            .map_err(|e| MeshError::Transport(format!("open stream to {}: {}", peer, e)))?;
        Ok(Box::new(stream))
    }
}

/// Health probe confirming an active transport connection.
struct ConnectionProbe {
    handle: NetworkHandle,
}

#[async_trait]
impl ConnectivityProbe for ConnectionProbe {
    async fn probe(&self, peer: &PeerId) -> MeshResult<()> {
        if self.handle.is_connected(peer).await {
            Ok(())
        } else {
            Err(MeshError::Transport(format!("no active connection to {}", peer)))
        }
    }
}

/// Provider publishing backed by the DHT.
struct DhtProvideBackend {
    handle: NetworkHandle,
}

#[async_trait]
impl ProvideBackend for DhtProvideBackend {
    async fn provide(&self, cid: &ContentId) -> MeshResult<()> {
        self.handle.provide(*cid).await
    }
}

/// One descriptor update as announced on the descriptor-updates topic.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct DescriptorAnnouncement {
    did: String,
    update: DescriptorUpdate,
}

/// Per-DID causal state for descriptor updates.
#[derive(Default)]
struct DescriptorState {
    clocks: std::collections::HashMap<String, VectorClock>,
    histories: std::collections::HashMap<String, UpdateHistory>,
}

/// Message bus transport publishing on the agent-messages gossip topic.
struct GossipBusTransport {
    gossip: Arc<GossipService>,
    topic: String,
}

#[async_trait]
impl BusTransport for GossipBusTransport {
    async fn publish(&self, message: &AgentMessage) -> MeshResult<()> {
        let data = serde_json::to_vec(message)?;
        self.gossip.publish(&self.topic, data, AGENT_MESSAGE_TAG).await
    }
}

/// A running AgentMesh node.
pub struct Node {
    config: MeshConfig,
    keypair: Keypair,
    local_peer_id: PeerId,
    handle: NetworkHandle,
    negotiator: ProtocolNegotiator,
    validator: DescriptorValidator,
    verifier: Arc<ContentVerifier>,
    store: Arc<dyn ContentStore>,
    qtable: Arc<QTable>,
    flow: Arc<FlowController>,
    bandwidth: Arc<BandwidthQoS>,
    pool: Arc<ConnectionPool>,
    health: Arc<HealthMonitor>,
    dedup: Arc<RequestDeduplicator<Vec<u8>>>,
    gossip: Arc<GossipService>,
    bus: Arc<MessageBus>,
    refresher: Option<Arc<ProviderRefresher>>,
    qrouting: Arc<QRoutingMessenger>,
    metrics: Arc<MeshMetrics>,
    control: libp2p_stream::Control,
    content_protocol: String,
    handshake_protocol: StreamProtocol,
    descriptor_state: Arc<tokio::sync::RwLock<DescriptorState>>,
    direct_messages: Mutex<Option<mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Node {
    /// Build a node with a fresh identity and a volatile content store.
    pub async fn new(config: MeshConfig) -> MeshResult<Self> {
        Self::with_store(config, Arc::new(MemoryContentStore::new())).await
    }

    /// Build a node with an injected content store implementation.
    pub async fn with_store(
        config: MeshConfig,
        store: Arc<dyn ContentStore>,
    ) -> MeshResult<Self> {
        Self::with_keypair(config, Keypair::generate_ed25519(), store).await
    }

    /// Build a node from an existing long-lived identity.
    pub async fn with_keypair(
        config: MeshConfig,
        keypair: Keypair,
        store: Arc<dyn ContentStore>,
    ) -> MeshResult<Self> {
        let negotiator = ProtocolNegotiator::new(&config.protocol)?;
        let local_peer_id = keypair.public().to_peer_id();
        let metrics = Arc::new(MeshMetrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Transport and actor.
        let swarm = build_swarm(keypair.clone(), &config, &negotiator)?;
        let (handle, gossip_rx, control) = NetworkActor::spawn(swarm);

        for address in &config.network.listen_addresses {
            let parsed: Multiaddr = address
                .parse()
                .map_err(|e| MeshError::Config(format!("listen address {:?}: {}", address, e)))?;
            if let Err(e) = handle.listen(parsed).await {
                warn!("failed to listen on {}: {}", address, e);
            }
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Flow, bandwidth, routing state.
        let flow = Arc::new(FlowController::new(&config.flow));
        let bandwidth = Arc::new(BandwidthQoS::new(&config.bandwidth));
        let qtable = Arc::new(QTable::new());

        // Gossip dispatch.
        let gossip = Arc::new(GossipService::new(handle.clone(), Arc::clone(&metrics)));
        tasks.push(gossip.spawn_dispatcher(gossip_rx));

        // Connection pool over the stream control.
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(ControlStreamFactory {
                control: control.clone(),
            }),
            &config.pool,
        ));
        tasks.push(pool.spawn_sweeper(shutdown_rx.clone()));

        // Health monitoring.
        let health = Arc::new(HealthMonitor::new(
            Arc::new(ConnectionProbe {
                handle: handle.clone(),
            }),
            &config.health,
        ));
        tasks.push(health.spawn_monitor(shutdown_rx.clone()));

        // Single-flight cache.
        let dedup = Arc::new(RequestDeduplicator::new(&config.dedup));
        tasks.push(dedup.spawn_sweeper(shutdown_rx.clone()));

        // Typed agent messaging over gossip.
        let bus = Arc::new(MessageBus::new(
            local_peer_id.to_string(),
            Arc::new(GossipBusTransport {
                gossip: Arc::clone(&gossip),
                topic: negotiator.agent_messages_topic(),
            }),
            Arc::clone(&metrics),
        ));
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        gossip
            .subscribe(
                &negotiator.agent_messages_topic(),
                Arc::new(move |message| {
                    let agent_message: AgentMessage = serde_json::from_slice(&message.payload)
                        .map_err(|e| {
                            MeshError::Serialization(format!("agent message: {}", e))
                        })?;
                    bus_tx
                        .send(agent_message)
                        .map_err(|_| MeshError::Handler("bus receiver gone".to_string()))
                }),
            )
            .await?;
        tasks.push(bus.spawn_receiver(bus_rx));
        tasks.push(bus.spawn_sweeper(shutdown_rx.clone()));

        // Optional DHT provider refreshing.
        let refresher = if config.dht.enabled {
            let refresher = Arc::new(ProviderRefresher::new(
                Arc::new(DhtProvideBackend {
                    handle: handle.clone(),
                }),
                Duration::from_secs(config.provider.refresh_interval_secs),
                Arc::clone(&metrics),
            ));
            tasks.push(refresher.spawn_refresher(shutdown_rx.clone()));
            Some(refresher)
        } else {
            None
        };

        // Content exchange server.
        let content_protocol = negotiator.content_exchange_protocol();
        let content_stream_protocol = StreamProtocol::try_from_owned(content_protocol.clone())
            .map_err(|e| MeshError::Config(format!("content-exchange protocol id: {}", e)))?;
        {
            let mut control = control.clone();
            tasks.push(content_exchange::spawn_server(
                &mut control,
                content_stream_protocol,
                Arc::clone(&store),
                Arc::clone(&metrics),
            )?);
        }

        // Q-routing messenger.
        let qrouting_protocol =
            StreamProtocol::try_from_owned(negotiator.qrouting_protocol())
                .map_err(|e| MeshError::Config(format!("qrouting protocol id: {}", e)))?;
        let qrouting = Arc::new(QRoutingMessenger::new(
            control.clone(),
            qrouting_protocol,
            Arc::clone(&qtable),
        ));
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        tasks.push(qrouting.spawn_inbound(direct_tx)?);

        // Causally-ordered descriptor updates over gossip.
        let descriptor_state = Arc::new(tokio::sync::RwLock::new(DescriptorState::default()));
        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<DescriptorAnnouncement>();
        gossip
            .subscribe(
                &negotiator.descriptor_updates_topic(),
                Arc::new(move |message| {
                    let announcement: DescriptorAnnouncement =
                        serde_json::from_slice(&message.payload).map_err(|e| {
                            MeshError::Serialization(format!("descriptor update: {}", e))
                        })?;
                    update_tx
                        .send(announcement)
                        .map_err(|_| MeshError::Handler("update receiver gone".to_string()))
                }),
            )
            .await?;
        {
            let descriptor_state = Arc::clone(&descriptor_state);
            let self_id = local_peer_id.to_string();
            tasks.push(tokio::spawn(async move {
                while let Some(announcement) = update_rx.recv().await {
                    let mut state = descriptor_state.write().await;
                    state
                        .clocks
                        .entry(announcement.did.clone())
                        .or_default()
                        .update(&self_id, &announcement.update.clock);
                    let outcome = state
                        .histories
                        .entry(announcement.did.clone())
                        .or_default()
                        .apply(announcement.update);
                    debug!("descriptor update for {}: {:?}", announcement.did, outcome);
                }
            }));
        }

        // Handshake server.
        let handshake_protocol =
            StreamProtocol::try_from_owned(negotiator.handshake_protocol())
                .map_err(|e| MeshError::Config(format!("handshake protocol id: {}", e)))?;
        tasks.push(Self::spawn_handshake_server(
            control.clone(),
            handshake_protocol.clone(),
            negotiator.clone(),
            handle.clone(),
        )?);

        let validator = DescriptorValidator::new(&config.descriptor);

        info!("node {} constructed", local_peer_id);

        Ok(Self {
            config,
            keypair,
            local_peer_id,
            handle,
            negotiator,
            validator,
            verifier: Arc::new(ContentVerifier::new()),
            store,
            qtable,
            flow,
            bandwidth,
            pool,
            health,
            dedup,
            gossip,
            bus,
            refresher,
            qrouting,
            metrics,
            control,
            content_protocol,
            handshake_protocol,
            descriptor_state,
            direct_messages: Mutex::new(Some(direct_rx)),
            shutdown_tx,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    // ===== PUBLISH / RESOLVE =====

    /// Publish descriptor bytes: hash, advertise as provider, store locally.
    /// Returns the CID string under which the bytes are resolvable.
    pub async fn publish(&self, bytes: &[u8]) -> MeshResult<String> {
        let cid = compute_cid(bytes);

        if let Some(refresher) = &self.refresher {
            refresher.provide(cid).await?;
        }
        self.store.put(&cid, bytes.to_vec()).await?;

        MeshMetrics::incr(&self.metrics.publishes);
        info!("published {} ({} bytes)", cid, bytes.len());
        Ok(cid.to_string())
    }

    /// Resolve a CID to its bytes, locally or from the best provider.
    pub async fn resolve(&self, cid_str: &str) -> MeshResult<Vec<u8>> {
        let cid = parse_cid(cid_str)?;
        MeshMetrics::incr(&self.metrics.resolves);

        if let Some(bytes) = self.store.get(&cid).await? {
            MeshMetrics::incr(&self.metrics.resolve_local_hits);
            return Ok(bytes);
        }

        // Concurrent resolves of the same CID share one network fetch.
        let key = format!("resolve:{}", cid);
        let result = self.dedup.run(&key, || self.fetch_from_network(cid)).await;
        if result.is_err() {
            MeshMetrics::incr(&self.metrics.resolve_failures);
        }
        result
    }

    async fn fetch_from_network(&self, cid: ContentId) -> MeshResult<Vec<u8>> {
        let candidates = self
            .handle
            .find_providers(cid, self.config.dht.max_providers, self.config.dht_lookup_timeout())
            .await?;
        let candidates: Vec<PeerId> = candidates
            .into_iter()
            .filter(|peer| *peer != self.local_peer_id)
            .collect();
        if candidates.is_empty() {
            return Err(MeshError::NotFound(format!("no providers for {}", cid)));
        }

        let peer = if candidates.len() == 1 {
            candidates[0]
        } else {
            self.qtable
                .select_best_peer(&candidates)
                .await
                .unwrap_or(candidates[0])
        };
        debug!("fetching {} from {}", cid, peer);

        // Reserve request bytes against flow limits before touching the wire.
        let id = cid.to_string();
        self.flow.allow_send(&peer, id.len() as u64).await?;

        let started = Instant::now();
        let fetched = self.fetch_from_peer(&peer, &cid).await;
        let latency = started.elapsed();

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                self.qtable.update_route(&peer, latency, false, 0).await;
                return Err(MeshError::Transport(format!(
                    "fetch of {} from {} failed: {}",
                    cid, peer, e
                )));
            }
        };
        self.bandwidth.record_download(&peer, bytes.len() as u64).await;

        if let Err(e) = self.verifier.verify(&cid, &bytes) {
            // The peer served bytes that do not match the identifier.
            self.qtable.update_route(&peer, latency, false, 0).await;
            MeshMetrics::incr(&self.metrics.verification_failures);
            return Err(e);
        }

        self.store.put(&cid, bytes.clone()).await?;
        self.qtable
            .update_route(&peer, latency, true, bytes.len() as u64)
            .await;
        self.metrics.observe_resolve_latency(latency);

        Ok(bytes)
    }

    async fn fetch_from_peer(&self, peer: &PeerId, cid: &ContentId) -> MeshResult<Vec<u8>> {
        let stream = self.pool.get_stream(peer, &self.content_protocol).await?;
        tokio::time::timeout(FETCH_TIMEOUT, content_exchange::fetch_content(stream, cid))
            .await
            .map_err(MeshError::from)?
    }

    // ===== DESCRIPTOR SIGNING =====

    /// Sign descriptor bytes with this node's identity key.
    pub fn sign_descriptor(&self, bytes: &[u8]) -> MeshResult<SignedDescriptor> {
        self.validator.sign(&self.keypair, bytes)
    }

    /// Verify a signed descriptor envelope, returning the authenticated peer.
    pub fn verify_descriptor(&self, envelope: &SignedDescriptor) -> MeshResult<PeerId> {
        self.validator.verify(envelope)
    }

    // ===== DESCRIPTOR UPDATES =====

    /// Publish a causally-ordered update for a descriptor identity. The
    /// update is applied to the local history first, then announced on the
    /// descriptor-updates topic.
    pub async fn publish_descriptor_update(
        &self,
        did: &str,
        payload: Vec<u8>,
    ) -> MeshResult<()> {
        let self_id = self.local_peer_id.to_string();
        let update = {
            let mut state = self.descriptor_state.write().await;
            let clock = state.clocks.entry(did.to_string()).or_default();
            clock.increment(&self_id);
            let clock = clock.clone();

            let previous_hash = state
                .histories
                .get(did)
                .and_then(UpdateHistory::latest)
                .map(|previous| hex::encode(sha2::Sha256::digest(&previous.payload)))
                .unwrap_or_default();
            let signature = self
                .keypair
                .sign(&payload)
                .map_err(|e| MeshError::Generic(format!("signing failed: {}", e)))?;

            let update = DescriptorUpdate {
                payload,
                clock,
                previous_hash,
                signature: hex::encode(signature),
                updater_id: self_id,
                timestamp: chrono::Utc::now().timestamp(),
            };
            state
                .histories
                .entry(did.to_string())
                .or_default()
                .apply(update.clone());
            update
        };

        let announcement = DescriptorAnnouncement {
            did: did.to_string(),
            update,
        };
        self.gossip
            .publish(
                &self.negotiator.descriptor_updates_topic(),
                serde_json::to_vec(&announcement)?,
                DESCRIPTOR_UPDATE_TAG,
            )
            .await
    }

    /// Latest accepted update for a descriptor identity.
    pub async fn latest_descriptor_update(&self, did: &str) -> Option<DescriptorUpdate> {
        self.descriptor_state
            .read()
            .await
            .histories
            .get(did)
            .and_then(UpdateHistory::latest)
            .cloned()
    }

    /// Number of concurrent-update conflicts recorded for an identity.
    pub async fn descriptor_conflicts(&self, did: &str) -> usize {
        self.descriptor_state
            .read()
            .await
            .histories
            .get(did)
            .map(|history| history.conflicts().len())
            .unwrap_or(0)
    }

    // ===== DIRECT MESSAGING =====

    /// Send bytes directly to the best-scored candidate, charging flow
    /// limits and feeding the QTable.
    pub async fn send_direct(&self, candidates: &[PeerId], bytes: &[u8]) -> MeshResult<PeerId> {
        let target = self
            .qtable
            .select_best_peer(candidates)
            .await
            .ok_or_else(|| MeshError::BadRequest("no candidates to send to".to_string()))?;

        self.flow.allow_send(&target, bytes.len() as u64).await?;
        let window_id = self.flow.acquire_window(&target).await;
        let result = self.qrouting.send_direct(&[target], bytes).await;
        if let Err(e) = self.flow.release_window(&target, window_id).await {
            debug!("window release for {}: {}", target, e);
        }
        if result.is_ok() {
            self.bandwidth.record_upload(&target, bytes.len() as u64).await;
        }
        result
    }

    /// Take the inbound direct-message stream. Yields `(sender, bytes)`.
    pub async fn take_direct_messages(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>> {
        self.direct_messages.lock().await.take()
    }

    // ===== LIFECYCLE =====

    /// Dial the configured bootstrap peers (logging and continuing on
    /// per-peer failure), then run the DHT bootstrap routine.
    pub async fn bootstrap(&self) -> MeshResult<()> {
        let mut entries = self.config.network.bootstrap_peers.clone();
        entries.shuffle(&mut rand::thread_rng());

        let mut connected = 0usize;
        for entry in &entries {
            match self.connect_bootstrap_peer(entry).await {
                Ok(peer) => {
                    connected += 1;
                    self.health.monitor_peer(peer).await;
                }
                Err(e) => warn!("bootstrap peer {:?} failed: {}", entry, e),
            }
        }
        info!("connected to {}/{} bootstrap peers", connected, entries.len());

        if self.config.dht.enabled {
            if let Err(e) = self.handle.bootstrap().await {
                // Without any DHT peer the routine cannot start; not fatal.
                warn!("kademlia bootstrap: {}", e);
            }
        }
        Ok(())
    }

    async fn connect_bootstrap_peer(&self, entry: &str) -> MeshResult<PeerId> {
        let addr: Multiaddr = entry
            .parse()
            .map_err(|e| MeshError::Config(format!("bootstrap address {:?}: {}", entry, e)))?;

        let peer = addr
            .iter()
            .find_map(|protocol| match protocol {
                libp2p::multiaddr::Protocol::P2p(peer) => Some(peer),
                _ => None,
            })
            .ok_or_else(|| {
                MeshError::Config(format!("bootstrap address {:?} carries no peer id", entry))
            })?;

        if self.config.dht.enabled {
            self.handle.add_peer_address(peer, addr.clone()).await?;
        }
        self.handle.dial(addr).await?;

        // Gate the peer on a version/feature handshake; an incompatible
        // peer is dropped instead of half-used.
        if let Err(e) = self.handshake_with(peer).await {
            if matches!(e, MeshError::Handshake(_)) {
                self.handle.disconnect_peer(peer);
                return Err(e);
            }
            // Transport hiccups leave the connection; identify/kad still work.
            debug!("handshake with {} did not complete: {}", peer, e);
        }

        Ok(peer)
    }

    /// Exchange and validate version handshakes with a peer.
    pub async fn handshake_with(&self, peer: PeerId) -> MeshResult<()> {
        let mut control = self.control.clone();
        let mut stream = control
            .open_stream(peer, self.handshake_protocol.clone())
            .await
            .map_err(|e| MeshError::Transport(format!("handshake stream: {}", e)))?;

        let local = serde_json::to_vec(&self.negotiator.local_handshake())?;
        stream
            .write_all(&local)
            .await
            .map_err(|e| MeshError::Transport(format!("handshake write: {}", e)))?;
        stream
            .close()
            .await
            .map_err(|e| MeshError::Transport(format!("handshake close: {}", e)))?;

        let payload = read_bounded(&mut stream, MAX_HANDSHAKE_SIZE).await?;
        let theirs: Handshake = serde_json::from_slice(&payload)
            .map_err(|e| MeshError::Serialization(format!("handshake payload: {}", e)))?;
        self.negotiator.validate(&theirs)
    }

    fn spawn_handshake_server(
        control: libp2p_stream::Control,
        protocol: StreamProtocol,
        negotiator: ProtocolNegotiator,
        handle: NetworkHandle,
    ) -> MeshResult<JoinHandle<()>> {
        let mut control = control;
        let mut incoming = control
            .accept(protocol)
            .map_err(|e| MeshError::Network(format!("handshake handler: {}", e)))?;

        Ok(tokio::spawn(async move {
            while let Some((peer, mut stream)) = incoming.next().await {
                let negotiator = negotiator.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    let payload = match read_bounded(&mut stream, MAX_HANDSHAKE_SIZE).await {
                        Ok(payload) => payload,
                        Err(e) => {
                            debug!("handshake read from {} failed: {}", peer, e);
                            return;
                        }
                    };
                    let theirs: Handshake = match serde_json::from_slice(&payload) {
                        Ok(handshake) => handshake,
                        Err(e) => {
                            warn!("malformed handshake from {}: {}", peer, e);
                            handle.disconnect_peer(peer);
                            return;
                        }
                    };
                    if let Err(e) = negotiator.validate(&theirs) {
                        warn!("rejecting {}: {}", peer, e);
                        handle.disconnect_peer(peer);
                        return;
                    }
                    let ours = match serde_json::to_vec(&negotiator.local_handshake()) {
                        Ok(ours) => ours,
                        Err(_) => return,
                    };
                    if stream.write_all(&ours).await.is_ok() {
                        let _ = stream.close().await;
                    }
                });
            }
        }))
    }

    /// Poll until at least `min` peers are connected or the deadline passes.
    pub async fn wait_for_peers(&self, min: usize, timeout: Duration) -> MeshResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let peers = self.handle.connected_peers().await?;
            if peers.len() >= min {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(MeshError::DeadlineExceeded(format!(
                    "{} of {} peers connected",
                    peers.len(),
                    min
                )));
            }
            tokio::time::sleep(PEER_POLL_INTERVAL).await;
        }
    }

    /// Shut the node down, unwinding in reverse construction order.
    /// Partial failures are logged; cleanup always runs to completion.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing node {}", self.local_peer_id);

        // Stop background sweepers and loops.
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        self.pool.close().await;
        if let Err(e) = self.store.close().await {
            warn!("content store close: {}", e);
        }
        self.handle.shutdown();
    }

    // ===== ACCESSORS =====

    pub fn peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// The DID this node signs descriptors under.
    pub fn did(&self) -> String {
        crate::identity::did_for_peer(&self.local_peer_id)
    }

    pub async fn listen_addresses(&self) -> MeshResult<Vec<Multiaddr>> {
        self.handle.listen_addresses().await
    }

    pub async fn connected_peers(&self) -> MeshResult<Vec<PeerId>> {
        self.handle.connected_peers().await
    }

    pub fn metrics(&self) -> &MeshMetrics {
        &self.metrics
    }

    pub fn qtable(&self) -> &Arc<QTable> {
        &self.qtable
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthQoS> {
        &self.bandwidth
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn gossip(&self) -> &Arc<GossipService> {
        &self.gossip
    }

    pub fn refresher(&self) -> Option<&Arc<ProviderRefresher>> {
        self.refresher.as_ref()
    }
}

/// Read a stream to end-of-stream with a byte cap.
async fn read_bounded<S>(stream: &mut S, cap: usize) -> MeshResult<Vec<u8>>
where
    S: futures::io::AsyncRead + Send + Unpin,
{
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| MeshError::Transport(format!("read: {}", e)))?;
        if n == 0 {
            return Ok(bytes);
        }
        if bytes.len() + n > cap {
            return Err(MeshError::Transport(format!("payload exceeds {} bytes", cap)));
        }
        bytes.extend_from_slice(&chunk[..n]);
    }
}

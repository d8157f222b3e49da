// ===================================================================================================
// Network Actor Module - Thread-Safe libp2p Communication Layer
// ===================================================================================================
//
// The libp2p Swarm is an event-driven state machine that wants to be polled from one task. This
// module isolates it behind the actor pattern: a dedicated task owns the swarm and processes
// typed commands arriving on a channel, while a clonable `NetworkHandle` gives every other
// component an async interface with oneshot response channels.
//
//   Application tasks --- NetworkCommand ---> NetworkActor (owns Swarm)
//                    <--- oneshot results ---
//
// DHT queries (provide / find-providers) are asynchronous inside Kademlia as well; the actor
// tracks them in pending maps keyed by QueryId, completing the caller's oneshot when the query
// finishes, collects enough providers, or times out. Gossip messages flow the other way: the
// actor forwards every received gossipsub message to an event channel consumed by the gossip
// service.

use futures::stream::StreamExt;
use libp2p::kad::{
    AddProviderOk, Event as KademliaEvent, GetProvidersOk, QueryId, QueryResult, RecordKey,
};
use libp2p::swarm::SwarmEvent;
use libp2p::{gossipsub, identify, mdns, Multiaddr, PeerId, Swarm};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::content_id::ContentId;
use crate::error::{MeshError, MeshResult};
use crate::network::{MeshBehaviour, MeshBehaviourEvent};

/// Default timeout for DHT operations
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Frequency of timeout cleanup and stats refresh
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Type-safe commands sent to the network actor.
#[derive(Debug)]
pub enum NetworkCommand {
    /// Start listening on a multiaddr.
    Listen {
        address: Multiaddr,
        response_tx: oneshot::Sender<MeshResult<()>>,
    },

    /// Dial a multiaddr. Resolves once the dial is enqueued; connection
    /// establishment is observed via the peer set.
    Dial {
        address: Multiaddr,
        response_tx: oneshot::Sender<MeshResult<()>>,
    },

    /// Seed the Kademlia routing table with a known peer address.
    AddPeerAddress {
        peer_id: PeerId,
        address: Multiaddr,
        response_tx: oneshot::Sender<MeshResult<()>>,
    },

    /// Advertise this node as a provider of a content id. Resolves when the
    /// provider record has been published (or the query fails).
    StartProviding {
        cid: ContentId,
        response_tx: oneshot::Sender<MeshResult<()>>,
    },

    /// Look up providers of a content id, resolving once `limit` providers
    /// are collected or the query finishes.
    GetProviders {
        cid: ContentId,
        limit: usize,
        response_tx: oneshot::Sender<MeshResult<Vec<PeerId>>>,
    },

    /// Run the Kademlia bootstrap routine against known peers.
    Bootstrap {
        response_tx: oneshot::Sender<MeshResult<()>>,
    },

    /// Subscribe the gossipsub behaviour to a topic.
    Subscribe {
        topic: String,
        response_tx: oneshot::Sender<MeshResult<()>>,
    },

    /// Unsubscribe the gossipsub behaviour from a topic.
    Unsubscribe {
        topic: String,
        response_tx: oneshot::Sender<MeshResult<()>>,
    },

    /// Publish bytes on a gossipsub topic.
    PublishGossip {
        topic: String,
        data: Vec<u8>,
        response_tx: oneshot::Sender<MeshResult<()>>,
    },

    /// Current set of peers with active connections.
    GetConnectedPeers {
        response_tx: oneshot::Sender<Vec<PeerId>>,
    },

    /// Addresses the swarm is currently listening on.
    GetListenAddresses {
        response_tx: oneshot::Sender<Vec<Multiaddr>>,
    },

    /// Close all connections to a peer (handshake rejection path).
    DisconnectPeer { peer_id: PeerId },

    /// Graceful actor shutdown.
    Shutdown,
}

/// A gossipsub message forwarded out of the actor.
#[derive(Debug, Clone)]
pub struct GossipEvent {
    pub topic: String,
    pub source: Option<PeerId>,
    pub data: Vec<u8>,
}

/// Snapshot of the network layer state.
#[derive(Debug, Clone)]
pub struct NetworkStats {
    pub connected_peers: usize,
    pub pending_queries: usize,
    pub routing_table_size: usize,
    pub local_peer_id: PeerId,
    pub listen_addresses: Vec<Multiaddr>,
}

/// Clonable, thread-safe handle for talking to the network actor.
#[derive(Clone)]
pub struct NetworkHandle {
    tx: mpsc::UnboundedSender<NetworkCommand>,
    stats: Arc<RwLock<NetworkStats>>,
    local_peer_id: PeerId,
}

impl NetworkHandle {
    fn send_command(&self, command: NetworkCommand) -> MeshResult<()> {
        self.tx
            .send(command)
            .map_err(|_| MeshError::Network("network actor unavailable".to_string()))
    }

    async fn await_response<T>(&self, rx: oneshot::Receiver<T>) -> MeshResult<T> {
        rx.await
            .map_err(|_| MeshError::Network("network operation cancelled".to_string()))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub async fn listen(&self, address: Multiaddr) -> MeshResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::Listen {
            address,
            response_tx,
        })?;
        self.await_response(response_rx).await?
    }

    pub async fn dial(&self, address: Multiaddr) -> MeshResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::Dial {
            address,
            response_tx,
        })?;
        self.await_response(response_rx).await?
    }

    pub async fn add_peer_address(&self, peer_id: PeerId, address: Multiaddr) -> MeshResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::AddPeerAddress {
            peer_id,
            address,
            response_tx,
        })?;
        self.await_response(response_rx).await?
    }

    /// Publish a provider record for a content id.
    pub async fn provide(&self, cid: ContentId) -> MeshResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::StartProviding { cid, response_tx })?;
        self.await_response(response_rx).await?
    }

    /// Collect up to `limit` providers of a content id within `timeout`.
    pub async fn find_providers(
        &self,
        cid: ContentId,
        limit: usize,
        timeout: Duration,
    ) -> MeshResult<Vec<PeerId>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::GetProviders {
            cid,
            limit,
            response_tx,
        })?;
        match tokio::time::timeout(timeout, self.await_response(response_rx)).await {
            Ok(result) => result?,
            Err(_) => Err(MeshError::DeadlineExceeded(
                "provider lookup timed out".to_string(),
            )),
        }
    }

    pub async fn bootstrap(&self) -> MeshResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::Bootstrap { response_tx })?;
        self.await_response(response_rx).await?
    }

    pub async fn subscribe(&self, topic: String) -> MeshResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::Subscribe { topic, response_tx })?;
        self.await_response(response_rx).await?
    }

    pub async fn unsubscribe(&self, topic: String) -> MeshResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::Unsubscribe { topic, response_tx })?;
        self.await_response(response_rx).await?
    }

    pub async fn publish_gossip(&self, topic: String, data: Vec<u8>) -> MeshResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::PublishGossip {
            topic,
            data,
            response_tx,
        })?;
        self.await_response(response_rx).await?
    }

    pub async fn connected_peers(&self) -> MeshResult<Vec<PeerId>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::GetConnectedPeers { response_tx })?;
        self.await_response(response_rx).await
    }

    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        match self.connected_peers().await {
            Ok(peers) => peers.contains(peer),
            Err(_) => false,
        }
    }

    pub async fn listen_addresses(&self) -> MeshResult<Vec<Multiaddr>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(NetworkCommand::GetListenAddresses { response_tx })?;
        self.await_response(response_rx).await
    }

    pub fn disconnect_peer(&self, peer_id: PeerId) {
        let _ = self.send_command(NetworkCommand::DisconnectPeer { peer_id });
    }

    pub fn shutdown(&self) {
        let _ = self.send_command(NetworkCommand::Shutdown);
    }

    /// Last stats snapshot maintained by the actor.
    pub async fn cached_stats(&self) -> NetworkStats {
        self.stats.read().await.clone()
    }
}

struct ProviderQuery {
    collected: HashSet<PeerId>,
    limit: usize,
    response_tx: Option<oneshot::Sender<MeshResult<Vec<PeerId>>>>,
    started: Instant,
}

/// The actor that owns the libp2p swarm.
pub struct NetworkActor {
    swarm: Swarm<MeshBehaviour>,
    rx: mpsc::UnboundedReceiver<NetworkCommand>,
    stats: Arc<RwLock<NetworkStats>>,
    gossip_tx: mpsc::UnboundedSender<GossipEvent>,
    connected: HashSet<PeerId>,
    listen_addrs: Vec<Multiaddr>,
    pending_provide: HashMap<QueryId, (oneshot::Sender<MeshResult<()>>, Instant)>,
    pending_providers: HashMap<QueryId, ProviderQuery>,
}

impl NetworkActor {
    /// Spawn the actor, returning the handle plus the gossip event stream
    /// and the raw stream control for side-channel protocols.
    pub fn spawn(
        swarm: Swarm<MeshBehaviour>,
    ) -> (
        NetworkHandle,
        mpsc::UnboundedReceiver<GossipEvent>,
        libp2p_stream::Control,
    ) {
        let local_peer_id = *swarm.local_peer_id();
        let control = swarm.behaviour().stream.new_control();
        let (tx, rx) = mpsc::unbounded_channel();
        let (gossip_tx, gossip_rx) = mpsc::unbounded_channel();

        let stats = Arc::new(RwLock::new(NetworkStats {
            connected_peers: 0,
            pending_queries: 0,
            routing_table_size: 0,
            local_peer_id,
            listen_addresses: Vec::new(),
        }));

        let actor = NetworkActor {
            swarm,
            rx,
            stats: Arc::clone(&stats),
            gossip_tx,
            connected: HashSet::new(),
            listen_addrs: Vec::new(),
            pending_provide: HashMap::new(),
            pending_providers: HashMap::new(),
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        (
            NetworkHandle {
                tx,
                stats,
                local_peer_id,
            },
            gossip_rx,
            control,
        )
    }

    /// Main actor loop.
    async fn run(mut self) {
        info!(
            "network actor starting with peer id {}",
            self.swarm.local_peer_id()
        );

        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(NetworkCommand::Shutdown) | None => {
                            info!("network actor shutting down");
                            break;
                        }
                        Some(command) => self.handle_command(command),
                    }
                }

                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }

                _ = maintenance.tick() => {
                    self.expire_pending_queries();
                    self.update_stats().await;
                }
            }
        }
    }

    fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::Listen {
                address,
                response_tx,
            } => {
                let result = self
                    .swarm
                    .listen_on(address)
                    .map(|_| ())
                    .map_err(|e| MeshError::Transport(format!("listen failed: {}", e)));
                let _ = response_tx.send(result);
            }

            NetworkCommand::Dial {
                address,
                response_tx,
            } => {
                let result = self
                    .swarm
                    .dial(address.clone())
                    .map_err(|e| MeshError::Transport(format!("dial {} failed: {}", address, e)));
                let _ = response_tx.send(result);
            }

            NetworkCommand::AddPeerAddress {
                peer_id,
                address,
                response_tx,
            } => {
                match self.swarm.behaviour_mut().kad.as_mut() {
                    Some(kad) => {
                        kad.add_address(&peer_id, address);
                        let _ = response_tx.send(Ok(()));
                    }
                    None => {
                        let _ = response_tx
                            .send(Err(MeshError::Network("DHT is disabled".to_string())));
                    }
                }
            }

            NetworkCommand::StartProviding { cid, response_tx } => {
                let key = RecordKey::new(&cid.to_bytes());
                match self.swarm.behaviour_mut().kad.as_mut() {
                    Some(kad) => match kad.start_providing(key) {
                        Ok(query_id) => {
                            self.pending_provide
                                .insert(query_id, (response_tx, Instant::now()));
                            debug!("provider record publish initiated for {}", cid);
                        }
                        Err(e) => {
                            let _ = response_tx.send(Err(MeshError::from(e)));
                        }
                    },
                    None => {
                        let _ = response_tx
                            .send(Err(MeshError::Network("DHT is disabled".to_string())));
                    }
                }
            }

            NetworkCommand::GetProviders {
                cid,
                limit,
                response_tx,
            } => {
                let key = RecordKey::new(&cid.to_bytes());
                match self.swarm.behaviour_mut().kad.as_mut() {
                    Some(kad) => {
                        let query_id = kad.get_providers(key);
                        self.pending_providers.insert(
                            query_id,
                            ProviderQuery {
                                collected: HashSet::new(),
                                limit: limit.max(1),
                                response_tx: Some(response_tx),
                                started: Instant::now(),
                            },
                        );
                        debug!("provider lookup initiated for {}", cid);
                    }
                    None => {
                        let _ = response_tx
                            .send(Err(MeshError::Network("DHT is disabled".to_string())));
                    }
                }
            }

            NetworkCommand::Bootstrap { response_tx } => {
                match self.swarm.behaviour_mut().kad.as_mut() {
                    Some(kad) => {
                        let result = kad
                            .bootstrap()
                            .map(|_| ())
                            .map_err(|e| MeshError::Network(format!("bootstrap failed: {}", e)));
                        let _ = response_tx.send(result);
                    }
                    None => {
                        let _ = response_tx
                            .send(Err(MeshError::Network("DHT is disabled".to_string())));
                    }
                }
            }

            NetworkCommand::Subscribe { topic, response_tx } => {
                let topic = gossipsub::IdentTopic::new(topic);
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&topic)
                    .map(|_| ())
                    .map_err(|e| MeshError::Network(format!("subscribe failed: {}", e)));
                let _ = response_tx.send(result);
            }

            NetworkCommand::Unsubscribe { topic, response_tx } => {
                let topic = gossipsub::IdentTopic::new(topic);
                self.swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
                let _ = response_tx.send(Ok(()));
            }

            NetworkCommand::PublishGossip {
                topic,
                data,
                response_tx,
            } => {
                let topic = gossipsub::IdentTopic::new(topic);
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(topic, data)
                    .map(|_| ())
                    .map_err(|e| MeshError::Network(format!("publish failed: {}", e)));
                let _ = response_tx.send(result);
            }

            NetworkCommand::GetConnectedPeers { response_tx } => {
                let _ = response_tx.send(self.connected.iter().copied().collect());
            }

            NetworkCommand::GetListenAddresses { response_tx } => {
                let _ = response_tx.send(self.listen_addrs.clone());
            }

            NetworkCommand::DisconnectPeer { peer_id } => {
                let _ = self.swarm.disconnect_peer_id(peer_id);
            }

            NetworkCommand::Shutdown => unreachable!("handled in run loop"),
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("listening on {}", address);
                self.listen_addrs.push(address);
            }

            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("connected to {}", peer_id);
                self.connected.insert(peer_id);
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    debug!("disconnected from {}", peer_id);
                    self.connected.remove(&peer_id);
                }
            }

            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),

            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: MeshBehaviourEvent) {
        match event {
            MeshBehaviourEvent::Kad(event) => self.handle_kad_event(event),

            MeshBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. }) => {
                let event = GossipEvent {
                    topic: message.topic.as_str().to_string(),
                    source: message.source,
                    data: message.data,
                };
                if self.gossip_tx.send(event).is_err() {
                    debug!("gossip consumer gone; dropping message");
                }
            }

            MeshBehaviourEvent::Gossipsub(_) => {}

            MeshBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                // Feed identified listen addresses into the routing table so
                // providers found via the DHT are dialable.
                if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                    for addr in info.listen_addrs {
                        kad.add_address(&peer_id, addr);
                    }
                }
            }

            MeshBehaviourEvent::Identify(_) => {}

            MeshBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, address) in peers {
                    debug!("mdns discovered {} at {}", peer_id, address);
                    if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                        kad.add_address(&peer_id, address.clone());
                    }
                    let _ = self.swarm.dial(address);
                }
            }

            MeshBehaviourEvent::Mdns(mdns::Event::Expired(_)) => {}

            MeshBehaviourEvent::Stream(()) => {}
        }
    }

    fn handle_kad_event(&mut self, event: KademliaEvent) {
        if let KademliaEvent::OutboundQueryProgressed {
            id, result, step, ..
        } = event
        {
            match result {
                QueryResult::StartProviding(result) => {
                    if let Some((response_tx, _)) = self.pending_provide.remove(&id) {
                        let outcome = result.map(|AddProviderOk { .. }| ()).map_err(|e| {
                            MeshError::DeadlineExceeded(format!("provider publish: {:?}", e))
                        });
                        let _ = response_tx.send(outcome);
                    }
                }

                QueryResult::GetProviders(result) => {
                    let finished = match result {
                        Ok(GetProvidersOk::FoundProviders { providers, .. }) => {
                            if let Some(query) = self.pending_providers.get_mut(&id) {
                                query.collected.extend(providers);
                                query.collected.len() >= query.limit
                            } else {
                                false
                            }
                        }
                        Ok(GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => true,
                        Err(_) => true,
                    };

                    if finished || step.last {
                        if let Some(mut query) = self.pending_providers.remove(&id) {
                            if let Some(response_tx) = query.response_tx.take() {
                                let providers: Vec<PeerId> =
                                    query.collected.into_iter().collect();
                                let _ = response_tx.send(Ok(providers));
                            }
                            // Stop the query early if Kademlia would keep going.
                            if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                                if let Some(mut ongoing) = kad.query_mut(&id) {
                                    ongoing.finish();
                                }
                            }
                        }
                    }
                }

                QueryResult::Bootstrap(Ok(_)) => {
                    debug!("kademlia bootstrap step completed");
                }

                QueryResult::Bootstrap(Err(e)) => {
                    warn!("kademlia bootstrap error: {:?}", e);
                }

                _ => {}
            }
        }
    }

    /// Fail DHT queries that outlived the operation timeout. Provider
    /// lookups resolve with whatever was collected so far.
    fn expire_pending_queries(&mut self) {
        let now = Instant::now();

        let expired: Vec<QueryId> = self
            .pending_provide
            .iter()
            .filter(|(_, (_, started))| now.duration_since(*started) > DEFAULT_OPERATION_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((response_tx, _)) = self.pending_provide.remove(&id) {
                let _ = response_tx.send(Err(MeshError::DeadlineExceeded(
                    "provider publish timed out".to_string(),
                )));
            }
        }

        let expired: Vec<QueryId> = self
            .pending_providers
            .iter()
            .filter(|(_, query)| now.duration_since(query.started) > DEFAULT_OPERATION_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut query) = self.pending_providers.remove(&id) {
                if let Some(response_tx) = query.response_tx.take() {
                    let _ = response_tx.send(Ok(query.collected.into_iter().collect()));
                }
            }
        }
    }

    async fn update_stats(&mut self) {
        let routing_table_size = self
            .swarm
            .behaviour_mut()
            .kad
            .as_mut()
            .map(|kad| kad.kbuckets().map(|bucket| bucket.num_entries()).sum())
            .unwrap_or(0);

        let mut stats = self.stats.write().await;
        stats.connected_peers = self.connected.len();
        stats.pending_queries = self.pending_provide.len() + self.pending_providers.len();
        stats.routing_table_size = routing_table_size;
        stats.listen_addresses = self.listen_addrs.clone();
    }
}

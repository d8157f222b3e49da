/// Network Module
///
/// This module sets up the libp2p swarm for an AgentMesh node. It combines:
/// - Kademlia DHT for provider records and key lookups (toggleable, client
///   or server mode)
/// - Gossipsub for topic pub/sub with signed messages and strict validation
/// - Identify for exchanging listen addresses and the protocol version
/// - mDNS for optional LAN rendezvous
/// - A stream behaviour providing raw per-peer streams for the
///   content-exchange and Q-routing protocols
///
/// All protocol identifiers carry the negotiated semantic version supplied
/// by the protocol negotiator, so incompatible nodes fail at stream
/// negotiation rather than mid-conversation.
use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::kad::{Behaviour as Kademlia, Event as KademliaEvent, Mode};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identify, mdns, noise, tcp, yamux, StreamProtocol, Swarm, SwarmBuilder};
use std::time::Duration;
use tracing::info;

use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::protocol::ProtocolNegotiator;

/// Combined network behaviour for an AgentMesh node.
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "MeshBehaviourEvent")]
pub struct MeshBehaviour {
    /// Kademlia DHT, absent when the DHT is disabled
    pub kad: Toggle<Kademlia<MemoryStore>>,
    /// Signed, strictly-validated topic pub/sub
    pub gossipsub: gossipsub::Behaviour,
    /// Peer metadata exchange carrying the negotiated protocol version
    pub identify: identify::Behaviour,
    /// LAN rendezvous, absent unless enabled
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Raw per-peer streams for the side-channel protocols
    pub stream: libp2p_stream::Behaviour,
}

/// Events emitted by the combined behaviour.
#[derive(Debug)]
pub enum MeshBehaviourEvent {
    Kad(KademliaEvent),
    Gossipsub(gossipsub::Event),
    Identify(identify::Event),
    Mdns(mdns::Event),
    Stream(()),
}

impl From<KademliaEvent> for MeshBehaviourEvent {
    fn from(event: KademliaEvent) -> Self {
        MeshBehaviourEvent::Kad(event)
    }
}

impl From<gossipsub::Event> for MeshBehaviourEvent {
    fn from(event: gossipsub::Event) -> Self {
        MeshBehaviourEvent::Gossipsub(event)
    }
}

impl From<identify::Event> for MeshBehaviourEvent {
    fn from(event: identify::Event) -> Self {
        MeshBehaviourEvent::Identify(event)
    }
}

impl From<mdns::Event> for MeshBehaviourEvent {
    fn from(event: mdns::Event) -> Self {
        MeshBehaviourEvent::Mdns(event)
    }
}

impl From<()> for MeshBehaviourEvent {
    fn from(_: ()) -> Self {
        MeshBehaviourEvent::Stream(())
    }
}

/// Build the swarm for a node identity according to configuration.
///
/// Listening and bootstrap dialing are the actor's job; this only wires the
/// transport stack and behaviours.
pub fn build_swarm(
    keypair: Keypair,
    config: &MeshConfig,
    negotiator: &ProtocolNegotiator,
) -> MeshResult<Swarm<MeshBehaviour>> {
    let local_peer_id = keypair.public().to_peer_id();
    info!("building swarm for peer {}", local_peer_id);

    let dht_enabled = config.dht.enabled;
    let dht_server = config.dht.server_mode;
    let provider_ttl = Duration::from_secs(config.dht.provider_ttl_secs);
    let lan_discovery = config.network.lan_discovery;
    let kad_protocol = StreamProtocol::try_from_owned(negotiator.kad_protocol())
        .map_err(|e| MeshError::Config(format!("kad protocol id: {}", e)))?;
    let identify_protocol = negotiator.handshake_protocol();

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| MeshError::Transport(format!("tcp transport: {}", e)))?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();

            let kad = if dht_enabled {
                let mut kad_config = libp2p::kad::Config::new(kad_protocol.clone());
                kad_config.set_provider_record_ttl(Some(provider_ttl));
                let store = MemoryStore::new(peer_id);
                let mut kad = Kademlia::with_config(peer_id, store, kad_config);
                kad.set_mode(Some(if dht_server { Mode::Server } else { Mode::Client }));
                Some(kad)
            } else {
                None
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(1))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .build()
                .map_err(|e| format!("gossipsub config: {}", e))?;
            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )?;

            let identify = identify::Behaviour::new(identify::Config::new(
                identify_protocol.clone(),
                key.public(),
            ));

            let mdns = if lan_discovery {
                Some(
                    mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                        .map_err(|e| format!("mdns: {}", e))?,
                )
            } else {
                None
            };

            Ok(MeshBehaviour {
                kad: Toggle::from(kad),
                gossipsub,
                identify,
                mdns: Toggle::from(mdns),
                stream: libp2p_stream::Behaviour::new(),
            })
        })
        .map_err(|e| MeshError::Transport(format!("behaviour setup: {}", e)))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout()))
        .build();

    Ok(swarm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_swarm_builds_with_dht_enabled() {
        let mut config = MeshConfig::default();
        config.dht.enabled = true;
        config.dht.server_mode = true;
        let negotiator = ProtocolNegotiator::new(&config.protocol).unwrap();

        let swarm = build_swarm(Keypair::generate_ed25519(), &config, &negotiator).unwrap();
        assert!(swarm.behaviour().kad.as_ref().is_some());
        assert!(swarm.behaviour().mdns.as_ref().is_none());
    }

    #[tokio::test]
    async fn test_swarm_builds_without_dht() {
        let config = MeshConfig::default();
        let negotiator = ProtocolNegotiator::new(&config.protocol).unwrap();

        let swarm = build_swarm(Keypair::generate_ed25519(), &config, &negotiator).unwrap();
        assert!(swarm.behaviour().kad.as_ref().is_none());
    }
}

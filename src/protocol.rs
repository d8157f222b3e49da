/// Protocol Negotiation Module
///
/// Every streamed protocol and gossip topic in the mesh carries the
/// negotiated semantic version in its wire identifier, so two nodes that
/// disagree about the protocol never get past stream negotiation. On top of
/// that, the handshake payload exchanges a feature list: peers reject each
/// other when the advertised version is below their minimum compatible
/// version or when a required feature is missing.
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ProtocolConfig;
use crate::error::{HandshakeFault, MeshError, MeshResult};

/// Base prefix of every mesh protocol identifier
pub const PROTOCOL_PREFIX: &str = "/agentmesh";

/// Base identifiers of the streamed protocols (versioned via [`ProtocolNegotiator::protocol_id`])
pub const KAD_PROTOCOL_BASE: &str = "/agentmesh/kad";
pub const HANDSHAKE_PROTOCOL_BASE: &str = "/agentmesh/handshake";
pub const CONTENT_EXCHANGE_PROTOCOL_BASE: &str = "/agentmesh/content-exchange";
pub const QROUTING_PROTOCOL_BASE: &str = "/agentmesh/qrouting";

/// Base identifiers of the gossip topics
pub const TOPIC_DESCRIPTOR_UPDATES_BASE: &str = "/agentmesh/descriptors";
pub const TOPIC_PEER_ANNOUNCEMENTS_BASE: &str = "/agentmesh/peers";
pub const TOPIC_CONTENT_ANNOUNCEMENTS_BASE: &str = "/agentmesh/content";
pub const TOPIC_AGENT_MESSAGES_BASE: &str = "/agentmesh/messages";

/// Version + feature exchange payload, JSON on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub version: String,
    pub features: Vec<String>,
    #[serde(default)]
    pub extensions: HashMap<String, serde_json::Value>,
}

/// Gates all protocol use with a peer on version and feature compatibility.
#[derive(Debug, Clone)]
pub struct ProtocolNegotiator {
    current: Version,
    min_compatible: Version,
    features: Vec<String>,
    required_features: Vec<String>,
}

impl ProtocolNegotiator {
    pub fn new(config: &ProtocolConfig) -> MeshResult<Self> {
        let current = Version::parse(&config.version)
            .map_err(|e| MeshError::Config(format!("protocol version: {}", e)))?;
        let min_compatible = Version::parse(&config.min_compatible_version)
            .map_err(|e| MeshError::Config(format!("min compatible version: {}", e)))?;
        if min_compatible > current {
            return Err(MeshError::Config(format!(
                "min compatible version {} exceeds current version {}",
                min_compatible, current
            )));
        }

        Ok(Self {
            current,
            min_compatible,
            features: config.features.clone(),
            required_features: config.required_features.clone(),
        })
    }

    pub fn version(&self) -> &Version {
        &self.current
    }

    /// Append the negotiated version to a base protocol identifier.
    pub fn protocol_id(&self, base: &str) -> String {
        format!("{}/{}", base, self.current)
    }

    /// The handshake payload this node advertises.
    pub fn local_handshake(&self) -> Handshake {
        Handshake {
            version: self.current.to_string(),
            features: self.features.clone(),
            extensions: HashMap::new(),
        }
    }

    /// Validate a peer's handshake against our version floor and required
    /// features.
    pub fn validate(&self, handshake: &Handshake) -> MeshResult<()> {
        let peer_version = Version::parse(&handshake.version).map_err(|_| {
            MeshError::Handshake(HandshakeFault::Malformed(handshake.version.clone()))
        })?;

        if peer_version < self.min_compatible {
            return Err(MeshError::Handshake(HandshakeFault::VersionTooOld(
                handshake.version.clone(),
            )));
        }

        for required in &self.required_features {
            if !handshake.features.iter().any(|f| f == required) {
                return Err(MeshError::Handshake(HandshakeFault::MissingFeature(
                    required.clone(),
                )));
            }
        }

        Ok(())
    }

    // Versioned identifiers for each streamed protocol and topic.

    pub fn kad_protocol(&self) -> String {
        self.protocol_id(KAD_PROTOCOL_BASE)
    }

    pub fn handshake_protocol(&self) -> String {
        self.protocol_id(HANDSHAKE_PROTOCOL_BASE)
    }

    pub fn content_exchange_protocol(&self) -> String {
        self.protocol_id(CONTENT_EXCHANGE_PROTOCOL_BASE)
    }

    pub fn qrouting_protocol(&self) -> String {
        self.protocol_id(QROUTING_PROTOCOL_BASE)
    }

    pub fn descriptor_updates_topic(&self) -> String {
        self.protocol_id(TOPIC_DESCRIPTOR_UPDATES_BASE)
    }

    pub fn peer_announcements_topic(&self) -> String {
        self.protocol_id(TOPIC_PEER_ANNOUNCEMENTS_BASE)
    }

    pub fn content_announcements_topic(&self) -> String {
        self.protocol_id(TOPIC_CONTENT_ANNOUNCEMENTS_BASE)
    }

    pub fn agent_messages_topic(&self) -> String {
        self.protocol_id(TOPIC_AGENT_MESSAGES_BASE)
    }
}

// ===================================================================================================
// AgentMesh Library - Peer-to-Peer Networking Core for a Decentralized Agent Marketplace
// ===================================================================================================
//
// AgentMesh lets mutually-distrusting peers publish, discover, retrieve and route messages for
// signed agent descriptors over a libp2p overlay. The crate is both a standalone node binary and
// a library embeddable in other Rust applications.
//
// ## KEY DESIGN PRINCIPLES
//
// ### 1. Actor-Isolated Transport
// The libp2p Swarm runs inside a dedicated actor task; every other component talks to it through
// a clonable handle with typed commands, keeping the rest of the crate free of swarm polling.
//
// ### 2. Content Addressing Everywhere
// Descriptors are identified by CIDv1/SHA-256 of their bytes. The same identifier is the DHT
// provider key, the content-store key and the argument of the content-exchange protocol, and
// every retrieved blob is re-hashed before it is stored or returned.
//
// ### 3. Learned Routing
// Whenever several peers could serve a request, a reinforcement-learned score table picks the
// target, and the observed latency and outcome of every interaction feed back into it.
//
// ### 4. Bounded Resources
// Token buckets, send windows, bandwidth accounting with strict-priority queuing, pooled
// streams with idle eviction, and a single-flight request cache keep every resource the node
// consumes explicitly bounded.
//
// ### 5. Versioned Protocols
// Every stream protocol and gossip topic carries the negotiated semantic version in its wire
// identifier, and a feature handshake gates peers before they are used.
//
// ===================================================================================================

// ===== CONTENT ADDRESSING AND VALIDATION =====
pub mod content_id;          // CIDv1/SHA-256 content identifiers
pub mod content_store;       // Injectable content-addressed blob storage
pub mod content_verifier;    // Hash/signature verification of retrieved bytes
pub mod descriptor;          // Signed agent descriptor envelopes
pub mod identity;            // DID parsing and peer-id derivation
pub mod vector_clock;        // Causal ordering and conflict resolution for descriptor updates

// ===== NETWORK AND P2P COMMUNICATION =====
pub mod network;             // libp2p swarm construction and combined behaviour
pub mod network_actor;       // Actor-based thread-safe swarm access
pub mod content_exchange;    // Length-prefixed blob fetch side channel
pub mod gossip;              // Signed topic pub/sub with handler dispatch
pub mod message_bus;         // Typed agent messaging with delivery guarantees
pub mod protocol;            // Version negotiation and protocol identifiers
pub mod provider_refresher;  // Periodic provider-record republishing
pub mod qrouting;            // Learned direct per-peer messaging

// ===== RESOURCE MANAGEMENT =====
pub mod bandwidth;           // Per-peer byte accounting and priority queuing
pub mod connection_pool;     // Pooled protocol streams with idle eviction
pub mod flow_control;        // Token buckets and send windows
pub mod qtable;              // Reinforcement-learned peer scores
pub mod request_dedup;       // Single-flight request cache

// ===== RELIABILITY AND OBSERVABILITY =====
pub mod error;               // Core error taxonomy
pub mod health_monitor;      // Heartbeat failure detector
pub mod monitoring;          // In-process metrics counters

// ===== SYSTEM CONFIGURATION AND LIFECYCLE =====
pub mod cli;                 // Command line parsing
pub mod config;              // TOML configuration with validated defaults
pub mod logging;             // Structured logging setup
pub mod node;                // Node lifecycle and end-to-end operations

// ===== CONVENIENCE RE-EXPORTS =====

/// Node lifecycle and the publish/resolve operations
pub use node::Node;

/// Configuration for a node
pub use config::MeshConfig;

/// Core error and result types
pub use error::{MeshError, MeshResult, VerificationFault};

/// Content identifier helpers
pub use content_id::{compute_cid, parse_cid, ContentId};

/// Content storage collaborator interface
pub use content_store::{ContentStore, MemoryContentStore};

/// Signed descriptor envelope and validator
pub use descriptor::{DescriptorValidator, SignedDescriptor};

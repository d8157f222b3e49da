// ===================================================================================================
// Error Handling System - Typed Error Kinds for the AgentMesh Networking Core
// ===================================================================================================
//
// This module defines the error types used across the AgentMesh networking core. The taxonomy
// mirrors how failures are recovered from:
//
// - Cancelled / DeadlineExceeded: structural, propagated unchanged to the caller.
// - NotFound, Transport, FlowLimit, QueueFull: transient local failures that are surfaced to the
//   immediate caller and never crash the node.
// - Verification / Handshake: carry a structured fault describing what exactly was rejected, so
//   callers (and tests) can branch on the precise failure.
// - Config / Io / Serialization / BadRequest: programmer or environment errors, fatal for the
//   operation that raised them only.
//
// Background sweepers never surface errors; they log and continue.

use std::error::Error as StdError;
use std::fmt;

/// Structured fault kinds produced by content and descriptor verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationFault {
    /// Retrieved bytes do not hash to the requested content id.
    HashMismatch,
    /// A configured signature verifier rejected the bytes.
    SignatureInvalid,
    /// Hashing the candidate bytes failed outright.
    HashComputationFailed,
    /// The signing public key could not be decoded.
    MalformedPublicKey,
    /// The descriptor carries no `did:` identity.
    MissingDid,
    /// The `did:` inside the descriptor does not match the signing key.
    DidMismatch,
    /// The envelope timestamp is older than the configured max age.
    Expired,
    /// The envelope timestamp is too far in the future.
    FutureTimestamped,
}

impl fmt::Display for VerificationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerificationFault::HashMismatch => "hash_mismatch",
            VerificationFault::SignatureInvalid => "signature_invalid",
            VerificationFault::HashComputationFailed => "hash_computation_failed",
            VerificationFault::MalformedPublicKey => "malformed_public_key",
            VerificationFault::MissingDid => "missing_did",
            VerificationFault::DidMismatch => "did_mismatch",
            VerificationFault::Expired => "expired",
            VerificationFault::FutureTimestamped => "future_timestamped",
        };
        write!(f, "{}", s)
    }
}

/// Structured fault kinds produced by protocol handshake validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFault {
    /// The peer's version string did not parse as semver.
    Malformed(String),
    /// The peer's version is below our minimum compatible version.
    VersionTooOld(String),
    /// The peer omitted a feature we require.
    MissingFeature(String),
}

impl fmt::Display for HandshakeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeFault::Malformed(v) => write!(f, "malformed version {:?}", v),
            HandshakeFault::VersionTooOld(v) => write!(f, "version {} below minimum", v),
            HandshakeFault::MissingFeature(feat) => write!(f, "missing required feature {:?}", feat),
        }
    }
}

/// Error type for all AgentMesh networking core operations.
///
/// Variants map one-to-one onto the recovery strategies described in the module
/// header. String payloads carry human-readable context; structured payloads
/// (`Verification`, `Handshake`) carry the machine-checkable fault kind.
#[derive(Debug)]
pub enum MeshError {
    // ===== STRUCTURAL ERRORS =====
    /// The operation was cancelled before it completed.
    Cancelled(String),

    /// The operation's deadline elapsed before it completed.
    DeadlineExceeded(String),

    // ===== TRANSIENT NETWORK FAILURES =====
    /// A requested resource (content, peer, record) does not exist locally or remotely.
    NotFound(String),

    /// Dial, stream open, read or write against a peer failed.
    Transport(String),

    /// A token bucket or send window refused the operation.
    FlowLimit(String),

    /// A bounded priority queue was full; the work item was dropped.
    QueueFull(String),

    // ===== VALIDATION FAILURES =====
    /// Content or descriptor verification rejected the bytes.
    Verification(VerificationFault),

    /// Protocol handshake validation rejected the peer.
    Handshake(HandshakeFault),

    // ===== SUBSYSTEM FAILURES =====
    /// Re-publishing a provider record failed; retried on the next tick.
    ProviderRefresh(String),

    /// A user-registered handler returned an error; dispatch continues.
    Handler(String),

    /// General network-layer failure (actor unavailable, DHT error, gossip error).
    Network(String),

    // ===== AMBIENT ERRORS =====
    /// File system I/O failure.
    Io(String),

    /// Configuration load, parse or validation failure.
    Config(String),

    /// Serialization or deserialization failure.
    Serialization(String),

    /// Invalid argument or misuse of an API.
    BadRequest(String),

    /// Catch-all for errors without a more specific category.
    Generic(String),
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::Cancelled(e) => write!(f, "Cancelled: {}", e),
            MeshError::DeadlineExceeded(e) => write!(f, "Deadline exceeded: {}", e),
            MeshError::NotFound(e) => write!(f, "Not found: {}", e),
            MeshError::Transport(e) => write!(f, "Transport failure: {}", e),
            MeshError::FlowLimit(e) => write!(f, "Flow limit exceeded: {}", e),
            MeshError::QueueFull(e) => write!(f, "Queue full: {}", e),
            MeshError::Verification(fault) => write!(f, "Verification failed: {}", fault),
            MeshError::Handshake(fault) => write!(f, "Handshake incompatible: {}", fault),
            MeshError::ProviderRefresh(e) => write!(f, "Provider refresh failed: {}", e),
            MeshError::Handler(e) => write!(f, "Handler error: {}", e),
            MeshError::Network(e) => write!(f, "Network error: {}", e),
            MeshError::Io(e) => write!(f, "IO error: {}", e),
            MeshError::Config(e) => write!(f, "Configuration error: {}", e),
            MeshError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MeshError::BadRequest(e) => write!(f, "Bad request: {}", e),
            MeshError::Generic(e) => write!(f, "Error: {}", e),
        }
    }
}

impl StdError for MeshError {}

impl MeshError {
    /// True for errors that indicate a transient condition the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeshError::NotFound(_)
                | MeshError::Transport(_)
                | MeshError::FlowLimit(_)
                | MeshError::QueueFull(_)
                | MeshError::ProviderRefresh(_)
        )
    }

    /// True when the error is a verification failure of the given fault kind.
    pub fn is_verification(&self, fault: &VerificationFault) -> bool {
        matches!(self, MeshError::Verification(f) if f == fault)
    }
}

impl From<std::io::Error> for MeshError {
    fn from(error: std::io::Error) -> Self {
        MeshError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(error: serde_json::Error) -> Self {
        MeshError::Serialization(error.to_string())
    }
}

impl From<hex::FromHexError> for MeshError {
    fn from(error: hex::FromHexError) -> Self {
        MeshError::Serialization(format!("Hex decode error: {}", error))
    }
}

impl From<cid::Error> for MeshError {
    fn from(error: cid::Error) -> Self {
        MeshError::BadRequest(format!("Invalid content id: {}", error))
    }
}

impl From<anyhow::Error> for MeshError {
    fn from(error: anyhow::Error) -> Self {
        MeshError::Generic(error.to_string())
    }
}

impl From<libp2p::kad::store::Error> for MeshError {
    fn from(error: libp2p::kad::store::Error) -> Self {
        MeshError::Network(format!("Kademlia store error: {:?}", error))
    }
}

impl From<tokio::time::error::Elapsed> for MeshError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MeshError::DeadlineExceeded("operation timed out".to_string())
    }
}

/// Result type alias for AgentMesh operations
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_fault_kind() {
        let err = MeshError::Verification(VerificationFault::HashMismatch);
        assert!(err.to_string().contains("hash_mismatch"));

        let err = MeshError::Handshake(HandshakeFault::MissingFeature("relay".into()));
        assert!(err.to_string().contains("relay"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(MeshError::NotFound("x".into()).is_transient());
        assert!(MeshError::QueueFull("x".into()).is_transient());
        assert!(!MeshError::Cancelled("x".into()).is_transient());
        assert!(!MeshError::Verification(VerificationFault::Expired).is_transient());
    }
}

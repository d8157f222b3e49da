/// Peer Identity Module
///
/// Agents are identified by DIDs of the form `did:mesh:<peer-id>`, where the
/// peer id is derived from the agent's long-lived Ed25519 public key exactly
/// as libp2p derives it. Binding the descriptor identity to the signing key
/// is the root invariant of descriptor validation: whoever controls the key
/// controls the DID, and nothing else does.
use libp2p::identity::PublicKey;
use libp2p::PeerId;

use crate::error::{MeshError, MeshResult};

/// DID scheme used by mesh descriptors
pub const DID_SCHEME: &str = "mesh";

/// Format the DID for a peer id.
pub fn did_for_peer(peer_id: &PeerId) -> String {
    format!("did:{}:{}", DID_SCHEME, peer_id)
}

/// Derive the DID implied by a public key.
pub fn did_for_public_key(public_key: &PublicKey) -> String {
    did_for_peer(&public_key.to_peer_id())
}

/// Parse `did:<scheme>:<peer-id>`, returning the embedded peer id.
///
/// Any scheme is accepted at parse time; matching the scheme is the
/// descriptor validator's job.
pub fn parse_did(did: &str) -> MeshResult<PeerId> {
    let mut parts = did.splitn(3, ':');
    let prefix = parts.next().unwrap_or_default();
    let scheme = parts.next().unwrap_or_default();
    let id = parts.next().unwrap_or_default();

    if prefix != "did" || scheme.is_empty() || id.is_empty() {
        return Err(MeshError::BadRequest(format!("malformed DID: {:?}", did)));
    }

    id.parse::<PeerId>()
        .map_err(|e| MeshError::BadRequest(format!("DID peer id {:?} invalid: {}", id, e)))
}

/// Scan free-form descriptor bytes for the first embedded `did:` identifier.
///
/// Descriptors are JSON-ish but deliberately treated as opaque here; the DID
/// is located textually so validation does not depend on the descriptor
/// schema.
pub fn extract_did(descriptor: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(descriptor);
    let start = text.find("did:")?;
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == ':' || c == '-' || c == '_'))
        .unwrap_or(rest.len());
    let did = &rest[..end];
    // A DID needs all three segments.
    if did.splitn(3, ':').count() == 3 {
        Some(did.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    #[test]
    fn test_did_round_trip() {
        let keypair = Keypair::generate_ed25519();
        let peer_id = keypair.public().to_peer_id();
        let did = did_for_peer(&peer_id);

        assert!(did.starts_with("did:mesh:"));
        assert_eq!(parse_did(&did).unwrap(), peer_id);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_did("did:mesh").is_err());
        assert!(parse_did("nid:mesh:abc").is_err());
        assert!(parse_did("did::abc").is_err());
        assert!(parse_did("did:mesh:@@@").is_err());
    }

    #[test]
    fn test_extract_did_from_descriptor() {
        let keypair = Keypair::generate_ed25519();
        let did = did_for_public_key(&keypair.public());
        let descriptor = format!(r#"{{"id":"{}","endpoints":["tcp://a:1"]}}"#, did);

        assert_eq!(extract_did(descriptor.as_bytes()), Some(did));
    }

    #[test]
    fn test_extract_did_missing() {
        assert_eq!(extract_did(b"{\"name\":\"agent\"}"), None);
        assert_eq!(extract_did(b"did:incomplete"), None);
    }
}

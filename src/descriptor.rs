/// Signed Descriptor Module
///
/// Agent descriptors are opaque bytes signed by the agent's long-lived
/// Ed25519 key. The envelope binds three things together: the descriptor
/// bytes, a unix-second timestamp (to bound replay), and the signing public
/// key. Verification additionally requires the `did:` identity embedded in
/// the descriptor to match the peer id derived from the signing key, so a
/// descriptor cannot claim an identity its key does not control.
use chrono::Utc;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::config::DescriptorConfig;
use crate::error::{MeshError, MeshResult, VerificationFault};
use crate::identity;

/// Signed agent descriptor envelope as carried on the wire.
///
/// `signature` covers `card ∥ ascii-decimal(timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedDescriptor {
    /// Opaque descriptor bytes
    pub card: Vec<u8>,
    /// Hex-encoded Ed25519 signature
    pub signature: String,
    /// Unix seconds at signing time
    pub timestamp: i64,
    /// Hex-encoded protobuf public key
    pub public_key: String,
}

impl SignedDescriptor {
    /// The exact byte string the signature covers.
    fn signed_message(card: &[u8], timestamp: i64) -> Vec<u8> {
        let mut message = card.to_vec();
        message.extend_from_slice(timestamp.to_string().as_bytes());
        message
    }
}

/// Signs and verifies agent descriptors.
pub struct DescriptorValidator {
    max_age: Duration,
    max_skew: Duration,
    auth_disabled: bool,
}

impl DescriptorValidator {
    pub fn new(config: &DescriptorConfig) -> Self {
        if config.auth_disabled {
            warn!("descriptor authentication is DISABLED; all envelopes will be accepted");
        }
        Self {
            max_age: Duration::from_secs(config.max_age_secs),
            max_skew: Duration::from_secs(config.max_skew_secs),
            auth_disabled: config.auth_disabled,
        }
    }

    /// Sign descriptor bytes with the node's keypair, stamping the current time.
    pub fn sign(&self, keypair: &Keypair, card: &[u8]) -> MeshResult<SignedDescriptor> {
        let timestamp = Utc::now().timestamp();
        let message = SignedDescriptor::signed_message(card, timestamp);
        let signature = keypair
            .sign(&message)
            .map_err(|e| MeshError::Generic(format!("signing failed: {}", e)))?;

        Ok(SignedDescriptor {
            card: card.to_vec(),
            signature: hex::encode(signature),
            timestamp,
            public_key: hex::encode(keypair.public().encode_protobuf()),
        })
    }

    /// Verify an envelope, returning the peer id it authenticates.
    ///
    /// Checks, in order: timestamp window, signature, public-key decoding,
    /// embedded DID presence, and DID/key identity match.
    pub fn verify(&self, envelope: &SignedDescriptor) -> MeshResult<PeerId> {
        if self.auth_disabled {
            warn!("descriptor authentication disabled; skipping verification");
            return self.identity_without_verification(envelope);
        }

        let now = Utc::now().timestamp();
        if now - envelope.timestamp > self.max_age.as_secs() as i64 {
            return Err(MeshError::Verification(VerificationFault::Expired));
        }
        if envelope.timestamp - now > self.max_skew.as_secs() as i64 {
            return Err(MeshError::Verification(VerificationFault::FutureTimestamped));
        }

        let public_key = self.decode_public_key(&envelope.public_key)?;

        let signature = hex::decode(&envelope.signature)
            .map_err(|_| MeshError::Verification(VerificationFault::SignatureInvalid))?;
        let message = SignedDescriptor::signed_message(&envelope.card, envelope.timestamp);
        if !public_key.verify(&message, &signature) {
            return Err(MeshError::Verification(VerificationFault::SignatureInvalid));
        }

        let did = identity::extract_did(&envelope.card)
            .ok_or(MeshError::Verification(VerificationFault::MissingDid))?;
        let claimed = identity::parse_did(&did)
            .map_err(|_| MeshError::Verification(VerificationFault::MissingDid))?;

        let derived = public_key.to_peer_id();
        if claimed != derived {
            return Err(MeshError::Verification(VerificationFault::DidMismatch));
        }

        Ok(derived)
    }

    fn decode_public_key(&self, hex_key: &str) -> MeshResult<PublicKey> {
        let bytes = hex::decode(hex_key)
            .map_err(|_| MeshError::Verification(VerificationFault::MalformedPublicKey))?;
        PublicKey::try_decode_protobuf(&bytes)
            .map_err(|_| MeshError::Verification(VerificationFault::MalformedPublicKey))
    }

    /// Best-effort identity extraction used only in auth-disabled mode.
    fn identity_without_verification(&self, envelope: &SignedDescriptor) -> MeshResult<PeerId> {
        if let Ok(key) = self.decode_public_key(&envelope.public_key) {
            return Ok(key.to_peer_id());
        }
        let did = identity::extract_did(&envelope.card)
            .ok_or(MeshError::Verification(VerificationFault::MissingDid))?;
        identity::parse_did(&did)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;

    fn validator() -> DescriptorValidator {
        DescriptorValidator::new(&MeshConfig::default().descriptor)
    }

    fn descriptor_for(keypair: &Keypair) -> Vec<u8> {
        let did = identity::did_for_public_key(&keypair.public());
        format!(r#"{{"id":"{}","endpoints":["/ip4/127.0.0.1/tcp/4001"]}}"#, did).into_bytes()
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = Keypair::generate_ed25519();
        let validator = validator();

        let envelope = validator.sign(&keypair, &descriptor_for(&keypair)).unwrap();
        let peer = validator.verify(&envelope).unwrap();
        assert_eq!(peer, keypair.public().to_peer_id());
    }

    #[test]
    fn test_tampered_card_fails_signature() {
        let keypair = Keypair::generate_ed25519();
        let validator = validator();

        let mut envelope = validator.sign(&keypair, &descriptor_for(&keypair)).unwrap();
        envelope.card.push(b'x');

        let err = validator.verify(&envelope).unwrap_err();
        assert!(err.is_verification(&VerificationFault::SignatureInvalid));
    }

    #[test]
    fn test_did_must_match_signing_key() {
        let signer = Keypair::generate_ed25519();
        let other = Keypair::generate_ed25519();
        let validator = validator();

        // Card claims `other`'s identity but is signed by `signer`.
        let envelope = validator.sign(&signer, &descriptor_for(&other)).unwrap();
        let err = validator.verify(&envelope).unwrap_err();
        assert!(err.is_verification(&VerificationFault::DidMismatch));
    }

    #[test]
    fn test_missing_did_rejected() {
        let keypair = Keypair::generate_ed25519();
        let validator = validator();

        let envelope = validator.sign(&keypair, b"{\"name\":\"agent\"}").unwrap();
        let err = validator.verify(&envelope).unwrap_err();
        assert!(err.is_verification(&VerificationFault::MissingDid));
    }

    #[test]
    fn test_expired_envelope_rejected() {
        let keypair = Keypair::generate_ed25519();
        let validator = validator();

        let mut envelope = validator.sign(&keypair, &descriptor_for(&keypair)).unwrap();
        envelope.timestamp -= 2 * 60 * 60;
        // Re-sign so only the age check can fail.
        let message = SignedDescriptor::signed_message(&envelope.card, envelope.timestamp);
        envelope.signature = hex::encode(keypair.sign(&message).unwrap());

        let err = validator.verify(&envelope).unwrap_err();
        assert!(err.is_verification(&VerificationFault::Expired));
    }

    #[test]
    fn test_future_envelope_rejected() {
        let keypair = Keypair::generate_ed25519();
        let validator = validator();

        let mut envelope = validator.sign(&keypair, &descriptor_for(&keypair)).unwrap();
        envelope.timestamp += 10 * 60;
        let message = SignedDescriptor::signed_message(&envelope.card, envelope.timestamp);
        envelope.signature = hex::encode(keypair.sign(&message).unwrap());

        let err = validator.verify(&envelope).unwrap_err();
        assert!(err.is_verification(&VerificationFault::FutureTimestamped));
    }

    #[test]
    fn test_malformed_public_key_rejected() {
        let keypair = Keypair::generate_ed25519();
        let validator = validator();

        let mut envelope = validator.sign(&keypair, &descriptor_for(&keypair)).unwrap();
        envelope.public_key = "zz-not-hex".to_string();

        let err = validator.verify(&envelope).unwrap_err();
        assert!(err.is_verification(&VerificationFault::MalformedPublicKey));
    }

    #[test]
    fn test_auth_disabled_accepts_anything() {
        let keypair = Keypair::generate_ed25519();
        let mut config = MeshConfig::default().descriptor;
        config.auth_disabled = true;
        let validator = DescriptorValidator::new(&config);

        let mut envelope = validator.sign(&keypair, &descriptor_for(&keypair)).unwrap();
        envelope.signature = "00".to_string();

        assert!(validator.verify(&envelope).is_ok());
    }
}

/// Content Verifier Module
///
/// Every blob fetched from a remote peer passes through here before it is
/// stored or handed to a caller. Verification is hash-first: the bytes must
/// hash to the content id they were requested under. A signature verifier
/// collaborator can be layered on top for descriptor-shaped content. Each
/// verification produces a chain of step records so callers and tests can
/// observe exactly how far a candidate got before rejection.
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::content_id::{compute_cid, ContentId};
use crate::error::{MeshError, MeshResult, VerificationFault};

/// Default bound on concurrent batch verifications
const DEFAULT_CONCURRENCY: usize = 10;

/// Signature check collaborator applied after the hash check when configured.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, bytes: &[u8]) -> MeshResult<()>;
}

/// Individual verification step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStep {
    Hash,
    Signature,
    Done,
}

/// One recorded verification step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: VerificationStep,
    pub ok: bool,
    pub at: DateTime<Utc>,
}

/// Ordered record of the steps one verification went through.
#[derive(Debug, Clone, Default)]
pub struct VerificationChain {
    records: Vec<StepRecord>,
}

impl VerificationChain {
    fn record(&mut self, step: VerificationStep, ok: bool) {
        self.records.push(StepRecord {
            step,
            ok,
            at: Utc::now(),
        });
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.records
    }

    /// True once the chain reached its `Done` marker with every step passing.
    pub fn completed(&self) -> bool {
        self.records.iter().all(|r| r.ok)
            && self
                .records
                .last()
                .map(|r| r.step == VerificationStep::Done)
                .unwrap_or(false)
    }
}

/// Hash (and optionally signature) verification of retrieved bytes.
pub struct ContentVerifier {
    signature_verifier: Option<Arc<dyn SignatureVerifier>>,
    batch_limit: Arc<Semaphore>,
}

impl ContentVerifier {
    /// Hash-only verifier.
    pub fn new() -> Self {
        Self {
            signature_verifier: None,
            batch_limit: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
        }
    }

    /// Verifier that also runs a signature check after the hash check.
    pub fn with_signature_verifier(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            signature_verifier: Some(verifier),
            batch_limit: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
        }
    }

    /// Override the batch concurrency bound.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.batch_limit = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Verify bytes against the content id they were requested under.
    pub fn verify(&self, expected: &ContentId, bytes: &[u8]) -> MeshResult<VerificationChain> {
        let mut chain = VerificationChain::default();

        let actual = compute_cid(bytes);
        let hash_ok = actual == *expected;
        chain.record(VerificationStep::Hash, hash_ok);
        if !hash_ok {
            debug!("hash mismatch: expected {} got {}", expected, actual);
            return Err(MeshError::Verification(VerificationFault::HashMismatch));
        }

        if let Some(verifier) = &self.signature_verifier {
            let sig_ok = verifier.verify(bytes).is_ok();
            chain.record(VerificationStep::Signature, sig_ok);
            if !sig_ok {
                return Err(MeshError::Verification(VerificationFault::SignatureInvalid));
            }
        }

        chain.record(VerificationStep::Done, true);
        Ok(chain)
    }

    /// Verify a batch in parallel, bounded by the concurrency semaphore.
    ///
    /// Results are returned in input order; one failure does not abort the
    /// other verifications.
    pub async fn verify_batch(
        self: &Arc<Self>,
        items: Vec<(ContentId, Vec<u8>)>,
    ) -> Vec<MeshResult<VerificationChain>> {
        let tasks = items.into_iter().map(|(cid, bytes)| {
            let verifier = Arc::clone(self);
            let limit = Arc::clone(&self.batch_limit);
            async move {
                let _permit = limit
                    .acquire()
                    .await
                    .map_err(|_| MeshError::Cancelled("verifier shut down".to_string()))?;
                verifier.verify(&cid, &bytes)
            }
        });
        join_all(tasks).await
    }
}

impl Default for ContentVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectAll;
    impl SignatureVerifier for RejectAll {
        fn verify(&self, _bytes: &[u8]) -> MeshResult<()> {
            Err(MeshError::Verification(VerificationFault::SignatureInvalid))
        }
    }

    struct AcceptAll;
    impl SignatureVerifier for AcceptAll {
        fn verify(&self, _bytes: &[u8]) -> MeshResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_verify_after_compute_succeeds() {
        let verifier = ContentVerifier::new();
        let bytes = b"hello world";
        let chain = verifier.verify(&compute_cid(bytes), bytes).unwrap();
        assert!(chain.completed());
        assert_eq!(chain.steps().len(), 2); // hash + done
    }

    #[test]
    fn test_tampered_bytes_fail_with_hash_mismatch() {
        let verifier = ContentVerifier::new();
        let cid = compute_cid(b"hello world");

        let err = verifier.verify(&cid, b"hello worl!").unwrap_err();
        assert!(err.is_verification(&VerificationFault::HashMismatch));
    }

    #[test]
    fn test_signature_step_runs_after_hash() {
        let bytes = b"signed content";
        let cid = compute_cid(bytes);

        let accepting = ContentVerifier::with_signature_verifier(Arc::new(AcceptAll));
        let chain = accepting.verify(&cid, bytes).unwrap();
        assert_eq!(chain.steps().len(), 3); // hash + signature + done

        let rejecting = ContentVerifier::with_signature_verifier(Arc::new(RejectAll));
        let err = rejecting.verify(&cid, bytes).unwrap_err();
        assert!(err.is_verification(&VerificationFault::SignatureInvalid));
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_isolates_failures() {
        let verifier = Arc::new(ContentVerifier::new().with_concurrency(2));

        let good = b"good".to_vec();
        let items = vec![
            (compute_cid(&good), good),
            (compute_cid(b"expected"), b"tampered".to_vec()),
        ];

        let results = verifier.verify_batch(items).await;
        assert!(results[0].is_ok());
        assert!(results[1]
            .as_ref()
            .unwrap_err()
            .is_verification(&VerificationFault::HashMismatch));
    }
}

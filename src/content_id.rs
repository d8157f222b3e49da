/// Content Identifier Module
///
/// Content handled by the mesh is addressed by a CIDv1 wrapping a SHA-256
/// multihash over the raw bytes. The same identifier is used as the DHT
/// provider key, the content-store key and the argument of the
/// content-exchange protocol, so everything downstream of `compute_cid`
/// agrees on what a blob is called.
use cid::multihash::Multihash;
use cid::Cid;
use sha2::{Digest, Sha256};

use crate::error::{MeshError, MeshResult};

/// Multicodec code for raw binary content
const RAW_CODEC: u64 = 0x55;
/// Multihash code for SHA-256
const SHA2_256: u64 = 0x12;

/// Content identifier used throughout the mesh
pub type ContentId = Cid;

/// Compute the deterministic content id of a byte string.
pub fn compute_cid(bytes: &[u8]) -> ContentId {
    let digest = Sha256::digest(bytes);
    // A 32-byte digest always fits the 64-byte multihash allocation.
    let multihash = Multihash::<64>::wrap(SHA2_256, &digest)
        .unwrap_or_else(|_| unreachable!("SHA-256 digest exceeds multihash allocation"));
    Cid::new_v1(RAW_CODEC, multihash)
}

/// Parse a multibase CID string, rejecting anything that is not a valid CID.
pub fn parse_cid(s: &str) -> MeshResult<ContentId> {
    Cid::try_from(s).map_err(MeshError::from)
}

/// True when `bytes` hash to exactly `expected`.
pub fn matches_cid(expected: &ContentId, bytes: &[u8]) -> bool {
    compute_cid(bytes) == *expected
}

//! Manifest versions
//!
//! A manifest is the cumulative table of contents of a session. Its
//! serialized bytes are a pure function of its fields (canonical CBOR, ordered
//! access list) so re-publishing the same state yields the same address.

use crate::crypto::{WrappedKey, IV_LEN};
use crate::errors::{CairnError, Result};
use crate::hash::Hash32;
use crate::identifiers::{GroupId, ObjectAddress, SessionId};
use crate::serialization::{from_cbor, hex_iv, to_canonical_cbor};
use crate::tree::{IntegrityLeaf, IntegrityTree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current manifest format
pub const MANIFEST_FORMAT_VERSION: u16 = 1;

/// One chunk as listed in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Chunk index
    pub index: u32,
    /// SHA-256 of the plaintext
    pub raw_hash: Hash32,
    /// SHA-256 of the ciphertext
    pub cipher_hash: Hash32,
    /// AES-GCM nonce
    #[serde(with = "hex_iv")]
    pub iv: [u8; IV_LEN],
    /// Where the ciphertext lives
    pub object_address: ObjectAddress,
    /// Capture time, unix ms
    pub captured_at: u64,
}

impl ChunkEntry {
    /// Integrity leaf inputs for this entry
    pub fn leaf(&self) -> IntegrityLeaf {
        IntegrityLeaf {
            index: self.index,
            raw_hash: self.raw_hash,
            cipher_hash: self.cipher_hash,
            captured_at: self.captured_at,
        }
    }
}

/// Whether more chunks may follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    /// The session was still capturing when this version was serialized
    Recording,
    /// The session had ended and this version lists every chunk
    Final,
}

/// One published state of a session's table of contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestVersion {
    /// Format version
    pub format: u16,
    /// Owning session
    pub session_id: SessionId,
    /// Ordered, cumulative chunk list
    pub chunks: Vec<ChunkEntry>,
    /// Root over `chunks`
    pub integrity_root: Hash32,
    /// Wrapped session key per group, fixed at session start
    pub access_list: BTreeMap<GroupId, WrappedKey>,
    /// Capture state when serialized
    pub status: ManifestStatus,
}

impl ManifestVersion {
    /// Canonical bytes for upload
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_canonical_cbor(self)
    }

    /// Decode bytes fetched from the object store
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = from_cbor(bytes)?;
        if manifest.format != MANIFEST_FORMAT_VERSION {
            return Err(CairnError::invalid(format!(
                "unsupported manifest format {}",
                manifest.format
            )));
        }
        Ok(manifest)
    }

    /// Content address the encoded manifest will have
    pub fn address(&self) -> Result<ObjectAddress> {
        Ok(ObjectAddress::for_content(&self.encode()?))
    }

    /// Replay all leaves through a fresh tree
    pub fn recompute_root(&self) -> Hash32 {
        IntegrityTree::from_leaves(self.chunks.iter().map(|c| c.leaf().hash())).root()
    }

    /// Structural checks: indices are exactly `0..len`
    pub fn validate(&self) -> Result<()> {
        for (position, entry) in self.chunks.iter().enumerate() {
            if entry.index as usize != position {
                return Err(CairnError::invalid(format!(
                    "manifest entry at position {position} has index {}",
                    entry.index
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u32) -> ChunkEntry {
        ChunkEntry {
            index,
            raw_hash: Hash32::from_bytes(&index.to_be_bytes()),
            cipher_hash: Hash32::from_bytes(&(index + 100).to_be_bytes()),
            iv: [index as u8; 12],
            object_address: ObjectAddress::for_content(&index.to_le_bytes()),
            captured_at: 1_700_000_000_000 + u64::from(index) * 10_000,
        }
    }

    fn manifest(n: u32) -> ManifestVersion {
        let chunks: Vec<ChunkEntry> = (0..n).map(entry).collect();
        let root = IntegrityTree::from_leaves(chunks.iter().map(|c| c.leaf().hash())).root();
        ManifestVersion {
            format: MANIFEST_FORMAT_VERSION,
            session_id: SessionId(uuid::Uuid::nil()),
            chunks,
            integrity_root: root,
            access_list: BTreeMap::new(),
            status: ManifestStatus::Recording,
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = manifest(4);
        let b = manifest(4);
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
        assert_eq!(a.address().unwrap(), b.address().unwrap());
    }

    #[test]
    fn test_decode_roundtrip_preserves_root() {
        let original = manifest(5);
        let decoded = ManifestVersion::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.recompute_root(), original.integrity_root);
    }

    #[test]
    fn test_validate_rejects_gaps() {
        let mut m = manifest(3);
        m.chunks.remove(1);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut m = manifest(1);
        m.format = 99;
        let bytes = m.encode().unwrap();
        assert!(matches!(
            ManifestVersion::decode(&bytes),
            Err(CairnError::Invalid { .. })
        ));
    }
}

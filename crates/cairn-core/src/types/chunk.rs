//! Chunk records and their status machine

use crate::crypto::IV_LEN;
use crate::errors::{CairnError, Result};
use crate::hash::Hash32;
use crate::identifiers::{ObjectAddress, SessionId};
use crate::serialization::{from_cbor, hex_iv, to_canonical_cbor};
use serde::{Deserialize, Serialize};

/// Lifecycle of one captured segment
///
/// `Pending → Uploaded → Manifested → Confirmed` on the happy path.
/// Any non-confirmed state may move to `Failed` when its queue task goes
/// terminal; an operator retry moves `Failed` back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Captured and persisted, not yet uploaded
    Pending,
    /// Ciphertext stored; object address known
    Uploaded,
    /// Included in a published manifest version
    Manifested,
    /// A ledger anchor covers this chunk; payload bytes may be dropped
    Confirmed,
    /// Upload gave up after the attempt ceiling
    Failed,
}

impl ChunkStatus {
    fn rank(self) -> u8 {
        match self {
            ChunkStatus::Pending => 0,
            ChunkStatus::Uploaded => 1,
            ChunkStatus::Manifested => 2,
            ChunkStatus::Confirmed => 3,
            ChunkStatus::Failed => 0,
        }
    }

    /// Whether the ciphertext is known to be in the object store
    pub fn is_uploaded(self) -> bool {
        matches!(
            self,
            ChunkStatus::Uploaded | ChunkStatus::Manifested | ChunkStatus::Confirmed
        )
    }

    /// Whether `next` is a legal successor
    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        match (self, next) {
            (ChunkStatus::Confirmed, _) => false,
            (_, ChunkStatus::Failed) => true,
            (ChunkStatus::Failed, ChunkStatus::Pending) => true,
            (ChunkStatus::Failed, _) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

/// Result of hashing, encrypting and uploading one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOutcome {
    /// SHA-256 of the plaintext
    pub raw_hash: Hash32,
    /// SHA-256 of the ciphertext
    pub cipher_hash: Hash32,
    /// AES-GCM nonce
    #[serde(with = "hex_iv")]
    pub iv: [u8; IV_LEN],
    /// Where the ciphertext lives
    pub object_address: ObjectAddress,
}

/// Durable metadata for one captured segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Owning session
    pub session_id: SessionId,
    /// Zero-based monotonic index
    pub index: u32,
    /// Current lifecycle state
    pub status: ChunkStatus,
    /// Set once uploaded
    pub outcome: Option<ChunkOutcome>,
    /// Plaintext length in bytes
    pub payload_len: u64,
    /// Capture time, unix ms
    pub captured_at: u64,
    /// Upload confirmation time, unix ms
    pub uploaded_at: Option<u64>,
    /// Ledger confirmation time, unix ms
    pub confirmed_at: Option<u64>,
    /// Failed upload attempts so far
    pub retry_count: u32,
    /// Most recent failure
    pub last_error: Option<String>,
}

impl ChunkRecord {
    /// Fresh record for a just-captured segment
    pub fn captured(session_id: SessionId, index: u32, payload_len: u64, captured_at: u64) -> Self {
        Self {
            session_id,
            index,
            status: ChunkStatus::Pending,
            outcome: None,
            payload_len,
            captured_at,
            uploaded_at: None,
            confirmed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Move to `next`, returning `false` if the record is already at or past it
    ///
    /// Replayed tasks after a restart re-apply transitions that already
    /// happened; those are no-ops rather than errors.
    pub fn advance(&mut self, next: ChunkStatus) -> Result<bool> {
        if self.status == next {
            return Ok(false);
        }
        if self.status.can_transition_to(next) {
            self.status = next;
            return Ok(true);
        }
        if next != ChunkStatus::Failed && next.rank() < self.status.rank() {
            return Ok(false);
        }
        Err(CairnError::invalid(format!(
            "chunk {} cannot move from {:?} to {next:?}",
            self.index, self.status
        )))
    }

    /// Record a successful upload
    pub fn mark_uploaded(&mut self, outcome: ChunkOutcome, at: u64) -> Result<bool> {
        let changed = self.advance(ChunkStatus::Uploaded)?;
        if changed {
            self.outcome = Some(outcome);
            self.uploaded_at = Some(at);
            self.last_error = None;
        }
        Ok(changed)
    }
}

/// Raw segment bytes as persisted at capture time
///
/// This is the only record written before a capture call returns, so it
/// carries everything needed to rebuild the chunk record after a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedPayload {
    /// Capture time, unix ms
    pub captured_at: u64,
    /// Plaintext segment
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

impl CapturedPayload {
    /// Compact CBOR bytes for the durable store
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_canonical_cbor(self)
    }

    /// Decode a persisted payload; damage is `StoreCorruption`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_cbor(bytes)
            .map_err(|e| CairnError::store_corruption(format!("Undecodable payload: {e}")))
    }

    /// Chunk record this payload implies before any upload
    pub fn record(&self, session_id: SessionId, index: u32) -> ChunkRecord {
        ChunkRecord::captured(session_id, index, self.bytes.len() as u64, self.captured_at)
    }
}

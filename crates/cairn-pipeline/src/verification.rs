//! Independent verification, decryption and reassembly
//!
//! A verifier needs nothing from the capture side except a manifest address,
//! the root the ledger recorded, and a group secret. Root mismatches and
//! per-chunk hash failures are reported in the [`VerificationReport`], as
//! are indices the manifest skips; only a missing or unusable access-list
//! entry is an error.

use crate::config::VerificationConfig;
use cairn_core::crypto::{derive_chunk_key, open_chunk, unwrap_session_key, GroupSecret, SessionKey};
use cairn_core::effects::{LedgerEffects, ObjectStore};
use cairn_core::{
    CairnError, ChunkEntry, GroupId, Hash32, ManifestStatus, ManifestVersion, ObjectAddress,
    Result, SessionId,
};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The verifier's group membership
#[derive(Clone, Debug)]
pub struct GroupCredential {
    /// Group the secret belongs to
    pub group_id: GroupId,
    /// Shared wrap secret of the group
    pub secret: GroupSecret,
}

/// Why a chunk did not verify
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkFailure {
    /// Ciphertext could not be fetched
    FetchFailed {
        /// Object store error
        message: String,
    },
    /// Fetched bytes do not hash to the manifest's cipher hash
    CipherHashMismatch {
        /// Hash recorded in the manifest
        expected: Hash32,
        /// Hash of the fetched bytes
        actual: Hash32,
    },
    /// Authenticated decryption failed
    DecryptFailed {
        /// Cipher error
        message: String,
    },
    /// Plaintext does not hash to the manifest's raw hash
    RawHashMismatch {
        /// Hash recorded in the manifest
        expected: Hash32,
        /// Hash of the decrypted bytes
        actual: Hash32,
    },
    /// The manifest lists a later chunk but has no entry for this one
    Missing,
}

impl ChunkFailure {
    /// Equivalent error, for callers that want to propagate it
    pub fn to_error(&self, index: u32) -> CairnError {
        match self {
            ChunkFailure::FetchFailed { message } => {
                CairnError::not_found(format!("chunk {index}: {message}"))
            }
            ChunkFailure::CipherHashMismatch { expected, actual } => CairnError::hash_mismatch(
                format!("chunk {index} ciphertext"),
                expected.to_hex(),
                actual.to_hex(),
            ),
            ChunkFailure::DecryptFailed { message } => {
                CairnError::encryption(format!("chunk {index}: {message}"))
            }
            ChunkFailure::RawHashMismatch { expected, actual } => CairnError::hash_mismatch(
                format!("chunk {index} plaintext"),
                expected.to_hex(),
                actual.to_hex(),
            ),
            ChunkFailure::Missing => {
                CairnError::invalid(format!("chunk {index} is not listed in the manifest"))
            }
        }
    }
}

/// Outcome for one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkCheck {
    /// Fetched, hash-checked and decrypted
    Verified,
    /// Reason the chunk was rejected
    Failed(ChunkFailure),
}

/// Per-chunk verification result
#[derive(Debug, Clone)]
pub struct ChunkVerification {
    /// Chunk index
    pub index: u32,
    /// Outcome
    pub status: ChunkCheck,
    /// Decrypted segment, present only when verified
    pub plaintext: Option<Vec<u8>>,
}

impl ChunkVerification {
    /// Whether the chunk passed every check
    pub fn is_verified(&self) -> bool {
        self.status == ChunkCheck::Verified
    }
}

/// Result of verifying one manifest
#[derive(Debug, Clone)]
pub struct VerificationReport {
    /// Verified session
    pub session_id: SessionId,
    /// Recomputed root equals the ledger root
    pub root_valid: bool,
    /// Root the caller obtained from the ledger
    pub ledger_root: Hash32,
    /// Root replayed from the manifest's leaves
    pub recomputed_root: Hash32,
    /// Recomputed root equals the root the manifest claims
    pub manifest_root_consistent: bool,
    /// Whether capture had ended when the manifest was written
    pub manifest_status: ManifestStatus,
    /// Results in index order
    pub per_chunk: Vec<ChunkVerification>,
}

impl VerificationReport {
    /// Root matches and every chunk verified
    pub fn is_complete(&self) -> bool {
        self.root_valid && self.per_chunk.iter().all(ChunkVerification::is_verified)
    }

    /// Chunks that passed every check
    pub fn verified_count(&self) -> usize {
        self.per_chunk.iter().filter(|c| c.is_verified()).count()
    }

    /// Indices of chunks that failed
    pub fn failed_indices(&self) -> Vec<u32> {
        self.per_chunk
            .iter()
            .filter(|c| !c.is_verified())
            .map(|c| c.index)
            .collect()
    }

    /// Verified segments concatenated in index order
    pub fn reassemble(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in &self.per_chunk {
            if let Some(plaintext) = &chunk.plaintext {
                out.extend_from_slice(plaintext);
            }
        }
        out
    }
}

/// Fetches, checks, decrypts and reassembles a session's chunks
pub struct VerificationService {
    object_store: Arc<dyn ObjectStore>,
    credential: GroupCredential,
    config: VerificationConfig,
}

impl VerificationService {
    /// Verifier reading from `object_store` as a member of one group
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        credential: GroupCredential,
        config: VerificationConfig,
    ) -> Self {
        Self {
            object_store,
            credential,
            config,
        }
    }

    /// Verify the manifest at `manifest_address` against `ledger_root`
    ///
    /// Returns `AccessDenied` before any chunk is fetched if the credential
    /// cannot unwrap the session key.
    pub async fn verify(
        &self,
        session_id: &SessionId,
        ledger_root: Hash32,
        manifest_address: &ObjectAddress,
    ) -> Result<VerificationReport> {
        let bytes = self.object_store.get(manifest_address).await?;
        let manifest = ManifestVersion::decode(&bytes)?;
        if &manifest.session_id != session_id {
            return Err(CairnError::invalid(format!(
                "Manifest {manifest_address} belongs to session {}, not {session_id}",
                manifest.session_id
            )));
        }

        let session_key = self.session_key(&manifest)?;

        let recomputed_root = manifest.recompute_root();
        let root_valid = recomputed_root == ledger_root;
        let manifest_root_consistent = recomputed_root == manifest.integrity_root;
        if !root_valid {
            warn!(%session_id, %ledger_root, %recomputed_root, "Integrity root does not match the ledger");
        }
        if !manifest_root_consistent {
            warn!(%session_id, claimed = %manifest.integrity_root, %recomputed_root, "Manifest root is inconsistent with its chunks");
        }

        let key = &session_key;
        let mut per_chunk: Vec<ChunkVerification> = stream::iter(manifest.chunks.iter())
            .map(|entry| self.check_chunk(key, entry))
            .buffer_unordered(self.config.max_concurrent_fetches.max(1))
            .collect()
            .await;
        let missing = missing_indices(&manifest.chunks);
        if !missing.is_empty() {
            warn!(%session_id, ?missing, "Manifest skips chunk indices");
        }
        per_chunk.extend(missing.into_iter().map(|index| ChunkVerification {
            index,
            status: ChunkCheck::Failed(ChunkFailure::Missing),
            plaintext: None,
        }));
        per_chunk.sort_by_key(|c| c.index);

        let report = VerificationReport {
            session_id: *session_id,
            root_valid,
            ledger_root,
            recomputed_root,
            manifest_root_consistent,
            manifest_status: manifest.status,
            per_chunk,
        };
        info!(
            %session_id,
            chunks = report.per_chunk.len(),
            verified = report.verified_count(),
            root_valid,
            "Verification finished"
        );
        Ok(report)
    }

    /// Verify whatever the ledger currently holds for `session_id`
    pub async fn verify_latest(
        &self,
        session_id: &SessionId,
        ledger: &dyn LedgerEffects,
    ) -> Result<VerificationReport> {
        let anchor = ledger.latest_anchor(session_id).await?.ok_or_else(|| {
            CairnError::not_found(format!("No anchor on the ledger for session {session_id}"))
        })?;
        self.verify(session_id, anchor.integrity_root, &anchor.manifest_address)
            .await
    }

    fn session_key(&self, manifest: &ManifestVersion) -> Result<SessionKey> {
        let group_id = &self.credential.group_id;
        let wrapped = manifest.access_list.get(group_id).ok_or_else(|| {
            CairnError::access_denied(format!(
                "Group {group_id} is not on the access list of session {}",
                manifest.session_id
            ))
        })?;
        unwrap_session_key(
            wrapped,
            &self.credential.secret,
            &manifest.session_id,
            group_id,
        )
    }

    async fn check_chunk(&self, key: &SessionKey, entry: &ChunkEntry) -> ChunkVerification {
        let index = entry.index;
        let status = match self.open_entry(key, entry).await {
            Ok(plaintext) => {
                return ChunkVerification {
                    index,
                    status: ChunkCheck::Verified,
                    plaintext: Some(plaintext),
                }
            }
            Err(failure) => failure,
        };
        warn!(index, failure = ?status, "Chunk failed verification");
        ChunkVerification {
            index,
            status: ChunkCheck::Failed(status),
            plaintext: None,
        }
    }

    async fn open_entry(
        &self,
        key: &SessionKey,
        entry: &ChunkEntry,
    ) -> std::result::Result<Vec<u8>, ChunkFailure> {
        let ciphertext = self
            .object_store
            .get(&entry.object_address)
            .await
            .map_err(|e| ChunkFailure::FetchFailed {
                message: e.to_string(),
            })?;

        let cipher_hash = Hash32::from_bytes(&ciphertext);
        if cipher_hash != entry.cipher_hash {
            return Err(ChunkFailure::CipherHashMismatch {
                expected: entry.cipher_hash,
                actual: cipher_hash,
            });
        }

        let plaintext = derive_chunk_key(key, entry.index)
            .and_then(|chunk_key| open_chunk(&chunk_key, &entry.iv, &ciphertext))
            .map_err(|e| ChunkFailure::DecryptFailed {
                message: e.to_string(),
            })?;

        let raw_hash = Hash32::from_bytes(&plaintext);
        if raw_hash != entry.raw_hash {
            return Err(ChunkFailure::RawHashMismatch {
                expected: entry.raw_hash,
                actual: raw_hash,
            });
        }
        debug!(index = entry.index, "Chunk verified");
        Ok(plaintext)
    }
}

/// Indices below the highest listed one that have no entry
fn missing_indices(entries: &[ChunkEntry]) -> Vec<u32> {
    let listed: BTreeSet<u32> = entries.iter().map(|e| e.index).collect();
    let Some(&last) = listed.last() else {
        return Vec::new();
    };
    (0..last).filter(|i| !listed.contains(i)).collect()
}

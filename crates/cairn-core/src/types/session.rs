//! Session records

use crate::crypto::WrappedKey;
use crate::hash::Hash32;
use crate::identifiers::{GroupId, ObjectAddress, SessionId};
use crate::types::manifest::ManifestStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting chunks
    Recording,
    /// Capture ended; waiting for outstanding tasks to drain
    Uploading,
    /// Ended and fully drained
    Complete,
    /// The process died while recording or uploading
    Interrupted,
}

impl SessionStatus {
    /// Whether no further status change will happen
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Interrupted)
    }
}

/// A published manifest version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPointer {
    /// Number of chunks in that version
    pub chunk_count: u32,
    /// Content address of the serialized manifest
    pub address: ObjectAddress,
    /// Whether that version was written after capture ended
    pub status: ManifestStatus,
}

impl ManifestPointer {
    /// Whether this version should replace `other` at the same chunk count
    ///
    /// A `Final` version is never displaced by a `Recording` one that was
    /// serialized before the session ended but landed later.
    pub fn supersedes(&self, other: &ManifestPointer) -> bool {
        self != other
            && !(other.status == ManifestStatus::Final && self.status != ManifestStatus::Final)
    }
}

/// Durable record of one recording session
///
/// `group_ids` and `access_list` are fixed at session start; a group added
/// later never gains access to chunks captured before it joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier
    pub session_id: SessionId,
    /// Current lifecycle state
    pub status: SessionStatus,
    /// Groups authorized at start
    pub group_ids: Vec<GroupId>,
    /// Session key wrapped once per group
    pub access_list: BTreeMap<GroupId, WrappedKey>,
    /// Chunks captured so far; also the next index to assign
    pub chunk_count: u32,
    /// Highest chunk count confirmed by the ledger
    pub anchored_chunk_count: u32,
    /// Root of the most recent confirmed anchor
    pub anchored_root: Option<Hash32>,
    /// Every published manifest version, ascending chunk count
    pub manifests: Vec<ManifestPointer>,
    /// Start time, unix ms
    pub started_at: u64,
    /// End time, unix ms
    pub ended_at: Option<u64>,
}

impl SessionRecord {
    /// New record in `Recording` state
    pub fn new(
        session_id: SessionId,
        group_ids: Vec<GroupId>,
        access_list: BTreeMap<GroupId, WrappedKey>,
        started_at: u64,
    ) -> Self {
        Self {
            session_id,
            status: SessionStatus::Recording,
            group_ids,
            access_list,
            chunk_count: 0,
            anchored_chunk_count: 0,
            anchored_root: None,
            manifests: Vec::new(),
            started_at,
            ended_at: None,
        }
    }

    /// Latest published manifest, if any
    pub fn latest_manifest(&self) -> Option<&ManifestPointer> {
        self.manifests.last()
    }

    /// Record a published manifest; returns `false` if nothing changed
    pub fn record_manifest(&mut self, pointer: ManifestPointer) -> bool {
        match self
            .manifests
            .binary_search_by_key(&pointer.chunk_count, |p| p.chunk_count)
        {
            Ok(pos) => {
                if pointer.supersedes(&self.manifests[pos]) {
                    self.manifests[pos] = pointer;
                    true
                } else {
                    false
                }
            }
            Err(pos) => {
                self.manifests.insert(pos, pointer);
                true
            }
        }
    }
}

/// Progress snapshot published per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProgress {
    /// Current lifecycle state
    pub status: SessionStatus,
    /// Segments accepted from the capture source
    pub chunks_captured: u32,
    /// Segments covered by a confirmed anchor
    pub chunks_confirmed: u32,
    /// Outstanding queue tasks for the session
    pub queue_depth: usize,
}

impl SessionProgress {
    /// Initial snapshot for a fresh session
    pub fn recording() -> Self {
        Self {
            status: SessionStatus::Recording,
            chunks_captured: 0,
            chunks_confirmed: 0,
            queue_depth: 0,
        }
    }

    /// Terminal and nothing left to drain
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && self.queue_depth == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointer(count: u32, tag: &[u8]) -> ManifestPointer {
        ManifestPointer {
            chunk_count: count,
            address: ObjectAddress::for_content(tag),
            status: ManifestStatus::Recording,
        }
    }

    #[test]
    fn test_manifest_history_stays_sorted() {
        let mut rec = SessionRecord::new(SessionId::new(), vec![], BTreeMap::new(), 0);
        assert!(rec.record_manifest(pointer(2, b"b")));
        assert!(rec.record_manifest(pointer(1, b"a")));
        assert!(rec.record_manifest(pointer(3, b"c")));
        let counts: Vec<u32> = rec.manifests.iter().map(|p| p.chunk_count).collect();
        assert_eq!(counts, vec![1, 2, 3]);
        assert_eq!(rec.latest_manifest().unwrap().chunk_count, 3);
    }

    #[test]
    fn test_duplicate_manifest_ignored() {
        let mut rec = SessionRecord::new(SessionId::new(), vec![], BTreeMap::new(), 0);
        assert!(rec.record_manifest(pointer(1, b"a")));
        assert!(!rec.record_manifest(pointer(1, b"a")));
        assert_eq!(rec.manifests.len(), 1);
    }

    #[test]
    fn test_final_version_is_not_displaced() {
        let mut rec = SessionRecord::new(SessionId::new(), vec![], BTreeMap::new(), 0);
        rec.record_manifest(pointer(2, b"recording"));
        let final_pointer = ManifestPointer {
            status: ManifestStatus::Final,
            ..pointer(2, b"final")
        };
        assert!(rec.record_manifest(final_pointer.clone()));
        assert!(!rec.record_manifest(pointer(2, b"recording")));
        assert_eq!(rec.latest_manifest(), Some(&final_pointer));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Complete.is_terminal());
        assert!(SessionStatus::Interrupted.is_terminal());
        assert!(!SessionStatus::Uploading.is_terminal());
    }
}

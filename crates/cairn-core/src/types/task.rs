//! Retryable queue tasks

use crate::hash::Hash32;
use crate::identifiers::{ObjectAddress, SessionId, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a queued task does when executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Encrypt and upload the persisted payload of one chunk
    UploadChunk {
        /// Chunk index
        index: u32,
    },
    /// Publish the manifest version covering the first `chunk_count` chunks
    UploadManifest {
        /// Chunks covered
        chunk_count: u32,
    },
    /// Commit a root and manifest address to the ledger
    AnchorCommit {
        /// Chunks covered by the root
        chunk_count: u32,
        /// Cumulative integrity root
        integrity_root: Hash32,
        /// Address of the manifest version with that root
        manifest_address: ObjectAddress,
    },
}

impl TaskKind {
    /// Short label for logs and events
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::UploadChunk { .. } => "upload_chunk",
            TaskKind::UploadManifest { .. } => "upload_manifest",
            TaskKind::AnchorCommit { .. } => "anchor_commit",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::UploadChunk { index } => write!(f, "upload_chunk[{index}]"),
            TaskKind::UploadManifest { chunk_count } => write!(f, "upload_manifest[{chunk_count}]"),
            TaskKind::AnchorCommit { chunk_count, .. } => write!(f, "anchor_commit[{chunk_count}]"),
        }
    }
}

/// Unit of retryable work, persisted before it becomes visible to workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTask {
    /// Sequence number; dispatch order among ready tasks
    pub id: TaskId,
    /// Owning session
    pub session_id: SessionId,
    /// Work to perform
    pub kind: TaskKind,
    /// Durable-store key of any payload the task reads
    pub payload_ref: Option<String>,
    /// Attempts already made
    pub attempt: u32,
    /// Earliest time the next attempt may start, unix ms
    pub next_attempt_at: u64,
    /// Gave up after the attempt ceiling or a non-transient error
    pub terminal: bool,
    /// Most recent failure
    pub last_error: Option<String>,
    /// Enqueue time, unix ms
    pub enqueued_at: u64,
}

impl QueueTask {
    /// A fresh task ready immediately
    pub fn new(
        id: TaskId,
        session_id: SessionId,
        kind: TaskKind,
        payload_ref: Option<String>,
        now: u64,
    ) -> Self {
        Self {
            id,
            session_id,
            kind,
            payload_ref,
            attempt: 0,
            next_attempt_at: now,
            terminal: false,
            last_error: None,
            enqueued_at: now,
        }
    }

    /// Whether a worker may pick this task up at `now`
    pub fn is_ready(&self, now: u64) -> bool {
        !self.terminal && now >= self.next_attempt_at
    }
}

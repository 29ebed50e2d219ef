//! # Cairn Core
//!
//! Pure domain layer for chunked, encrypted, verifiable capture.
//!
//! This crate holds everything capture and verification must agree on
//! byte-for-byte, and nothing that performs I/O:
//!
//! - **Errors** ([`errors`]): the unified [`CairnError`] taxonomy
//! - **Hashing** ([`hash`]): SHA-256 digests and [`Hash32`]
//! - **Crypto** ([`crypto`]): per-chunk HKDF keys, AES-256-GCM sealing, key wrapping
//! - **Integrity** ([`tree`]): the append-only [`IntegrityTree`] and inclusion proofs
//! - **Records** ([`types`]): chunk, session, manifest and queue task records
//! - **Effects** ([`effects`]): traits for the durable store, object store,
//!   ledger, key service and clock

pub mod crypto;
pub mod effects;
pub mod errors;
pub mod hash;
pub mod identifiers;
pub mod serialization;
pub mod tree;
pub mod types;

pub use errors::{CairnError, Result};
pub use hash::{Hash32, Hasher};
pub use identifiers::{GroupId, ObjectAddress, SessionId, TaskId};
pub use tree::{build_root, IntegrityLeaf, IntegrityProof, IntegrityTree};
pub use types::{
    CapturedPayload, ChunkEntry, ChunkOutcome, ChunkRecord, ChunkStatus, ManifestPointer, ManifestStatus,
    ManifestVersion, QueueTask, SessionProgress, SessionRecord, SessionStatus, TaskKind,
};

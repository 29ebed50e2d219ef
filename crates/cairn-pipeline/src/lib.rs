//! # Cairn Pipeline
//!
//! Runtime half of cairn: turns captured segments into encrypted uploads,
//! growing manifests and ledger anchors, and verifies the result.
//!
//! ## Capture path
//!
//! [`SessionCoordinator`] persists each segment with one durable write and
//! returns; a background intake then records the chunk and enqueues its
//! upload on the [`DurableQueue`]. Uploads run concurrently through [`ChunkProcessor`];
//! the [`ManifestBuilder`] only advances on the lowest missing index, so the
//! integrity root never depends on completion order. Each new manifest
//! version is published and followed by an anchor commit, which later
//! commits supersede.
//!
//! ## Verification path
//!
//! [`VerificationService`] fetches a manifest, replays its leaves against the
//! ledger root, then fetches, checks and decrypts every chunk.
//!
//! ## Restarts
//!
//! Tasks, chunk records and session records live in a
//! [`DurableStore`](cairn_core::effects::DurableStore). Reopening a
//! coordinator on the same store marks unfinished sessions interrupted and
//! resumes every outstanding task.

pub mod config;
pub mod manifest;
pub mod processor;
pub mod queue;
pub mod records;
pub mod reliability;
pub mod session;
pub mod task_registry;
pub mod verification;

pub use config::{
    AnchorConfig, AnchorPolicy, CairnConfig, QueueConfig, StorageConfig, VerificationConfig,
};
pub use manifest::{EncodedManifest, ManifestBuilder};
pub use processor::ChunkProcessor;
pub use queue::{DurableQueue, QueueEvent, TaskHandler};
pub use records::RecordStore;
pub use reliability::{BackoffStrategy, RetryPolicy};
pub use session::{PipelineEffects, SessionCoordinator};
pub use verification::{
    ChunkCheck, ChunkFailure, ChunkVerification, GroupCredential, VerificationReport,
    VerificationService,
};

//! Data-model records shared by capture and verification

pub mod chunk;
pub mod manifest;
pub mod session;
pub mod task;

pub use chunk::{CapturedPayload, ChunkOutcome, ChunkRecord, ChunkStatus};
pub use manifest::{ChunkEntry, ManifestStatus, ManifestVersion, MANIFEST_FORMAT_VERSION};
pub use session::{ManifestPointer, SessionProgress, SessionRecord, SessionStatus};
pub use task::{QueueTask, TaskKind};

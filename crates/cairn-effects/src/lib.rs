//! # Cairn Effects
//!
//! Handlers for the collaborator traits declared in `cairn_core::effects`.
//!
//! - [`MemoryDurableStore`] and [`FilesystemDurableStore`] for local persistence
//! - [`MemoryObjectStore`], a SHA-256 content-addressed blob store
//! - [`MemoryLedger`], an in-process anchor ledger
//! - [`StaticKeyService`], group secrets held in memory
//! - [`SystemClock`], wall-clock time
//!
//! The in-memory handlers are cheap to clone; clones share state, which is
//! how tests simulate a process restart over the same storage.

pub mod keys;
pub mod ledger;
pub mod object_store;
pub mod storage;
pub mod time;

pub use keys::StaticKeyService;
pub use ledger::MemoryLedger;
pub use object_store::MemoryObjectStore;
pub use storage::{FilesystemDurableStore, MemoryDurableStore};
pub use time::SystemClock;

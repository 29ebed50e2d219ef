//! Collaborator effect traits
//!
//! Every external capability the pipeline consumes is expressed as a trait
//! here and implemented in `cairn-effects` (or wrapped with fault injection
//! in `cairn-testkit`). Pipeline components receive them as `Arc<dyn ...>`.
//!
//! - [`DurableStore`]: local key-value persistence for records and queue tasks
//! - [`ObjectStore`]: content-addressed blob store for ciphertext and manifests
//! - [`LedgerEffects`]: anchor commits and latest-root lookup
//! - [`KeyEffects`]: group wrap secrets
//! - [`PhysicalTimeEffects`]: wall-clock milliseconds

pub mod keys;
pub mod ledger;
pub mod object_store;
pub mod storage;
pub mod time;

pub use keys::KeyEffects;
pub use ledger::{AnchorRecord, AnchorRequest, LedgerEffects, TxReceipt};
pub use object_store::ObjectStore;
pub use storage::DurableStore;
pub use time::PhysicalTimeEffects;

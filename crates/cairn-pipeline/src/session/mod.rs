//! Session coordination
//!
//! [`SessionCoordinator`] is the capture-side entry point. Queue tasks are
//! executed by an internal handler and their outcomes are mirrored onto
//! chunk and session records by an event listener; both share one context.

mod context;
mod coordinator;
mod handler;
mod progress;
mod runtime;

pub use context::PipelineEffects;
pub use coordinator::SessionCoordinator;
pub use progress::ProgressHub;
pub use runtime::recover_session_key;

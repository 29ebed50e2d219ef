//! Cairn Testing Infrastructure
//!
//! Collaborators that fail, stall or corrupt on demand, plus fixtures that
//! wire a [`SessionCoordinator`](cairn_pipeline::SessionCoordinator) over
//! shared in-memory state so a test can drop it and reopen it as if the
//! process had restarted.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
//!
//! # Usage
//!
//! ```rust,no_run
//! use cairn_testkit::{fixtures::TestHarness, init_tracing};
//!
//! # async fn demo() {
//! init_tracing();
//! let harness = TestHarness::new(&["family"]);
//! let coordinator = harness.open().await;
//! # }
//! ```

pub mod faults;
pub mod fixtures;
pub mod logging;

pub use faults::{FaultyDurableStore, FaultyLedger, FaultyObjectStore};
pub use fixtures::{group_secret, segment, TestHarness};
pub use logging::init_tracing;

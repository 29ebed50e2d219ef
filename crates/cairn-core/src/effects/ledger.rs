//! Ledger / anchor service

use crate::errors::Result;
use crate::hash::Hash32;
use crate::identifiers::{GroupId, ObjectAddress, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Arguments of one anchor commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRequest {
    /// Session being anchored
    pub session_id: SessionId,
    /// Cumulative integrity root
    pub integrity_root: Hash32,
    /// Manifest version carrying that root
    pub manifest_address: ObjectAddress,
    /// Chunks covered
    pub chunk_count: u32,
    /// Groups authorized for the session
    pub group_ids: Vec<GroupId>,
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    /// Ledger transaction identifier
    pub tx_id: String,
}

/// The most recent anchor recorded for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    /// Anchored root
    pub integrity_root: Hash32,
    /// Anchored manifest address
    pub manifest_address: ObjectAddress,
    /// Chunks covered
    pub chunk_count: u32,
}

/// External ledger that durably records session roots
#[async_trait]
pub trait LedgerEffects: Send + Sync {
    /// Record a root for the session
    async fn commit(&self, request: AnchorRequest) -> Result<TxReceipt>;

    /// Latest anchor for the session, if any
    async fn latest_anchor(&self, session_id: &SessionId) -> Result<Option<AnchorRecord>>;
}

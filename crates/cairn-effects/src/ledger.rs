//! In-memory anchor ledger

use async_trait::async_trait;
use cairn_core::effects::{AnchorRecord, AnchorRequest, LedgerEffects, TxReceipt};
use cairn_core::{Result, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct LedgerState {
    next_tx: u64,
    commits: HashMap<SessionId, Vec<AnchorRequest>>,
}

/// Ledger that records every commit in memory; clones share state
///
/// The latest anchor of a session is the commit covering the most chunks,
/// so a late-landing stale commit never rolls a session back.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Every commit recorded for `session_id`, in arrival order
    pub fn commits(&self, session_id: &SessionId) -> Vec<AnchorRequest> {
        self.state
            .lock()
            .commits
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total commits across all sessions
    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl LedgerEffects for MemoryLedger {
    async fn commit(&self, request: AnchorRequest) -> Result<TxReceipt> {
        let mut state = self.state.lock();
        state.next_tx += 1;
        let tx_id = format!("tx-{}", state.next_tx);
        state
            .commits
            .entry(request.session_id)
            .or_default()
            .push(request);
        Ok(TxReceipt { tx_id })
    }

    async fn latest_anchor(&self, session_id: &SessionId) -> Result<Option<AnchorRecord>> {
        let state = self.state.lock();
        Ok(state.commits.get(session_id).and_then(|commits| {
            commits
                .iter()
                .max_by_key(|c| c.chunk_count)
                .map(|c| AnchorRecord {
                    integrity_root: c.integrity_root,
                    manifest_address: c.manifest_address.clone(),
                    chunk_count: c.chunk_count,
                })
        }))
    }
}

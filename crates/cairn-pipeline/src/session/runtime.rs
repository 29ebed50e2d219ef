//! In-memory state of one session: its key and manifest builder

use crate::manifest::{entry_from_record, ManifestBuilder};
use cairn_core::crypto::{unwrap_session_key, SessionKey};
use cairn_core::effects::{KeyEffects, ObjectStore};
use cairn_core::{CairnError, ChunkEntry, ChunkRecord, Result, SessionId, SessionRecord};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Builder plus uploaded chunks waiting for a lower index to land
pub struct ManifestState {
    pub builder: ManifestBuilder,
    detached: BTreeMap<u32, ChunkEntry>,
}

impl ManifestState {
    fn new(builder: ManifestBuilder, detached: Vec<ChunkEntry>) -> Self {
        Self {
            builder,
            detached: detached.into_iter().map(|e| (e.index, e)).collect(),
        }
    }

    /// Whether chunk `index` is already part of the builder
    pub fn contains(&self, index: u32) -> bool {
        (index as usize) < self.builder.len()
    }

    /// Take an uploaded chunk; returns the indices appended to the builder,
    /// in order. Completion order never affects the resulting tree since a
    /// chunk is only appended once every lower index is present.
    pub fn accept(&mut self, entry: ChunkEntry) -> Result<Vec<u32>> {
        if self.contains(entry.index) {
            return Ok(Vec::new());
        }
        self.detached.insert(entry.index, entry);
        let mut appended = Vec::new();
        while let Some(next) = self.detached.remove(&(self.builder.len() as u32)) {
            let index = next.index;
            self.builder.add_chunk(next)?;
            appended.push(index);
        }
        Ok(appended)
    }

    /// Uploaded chunks still waiting on a gap
    pub fn detached_count(&self) -> usize {
        self.detached.len()
    }
}

/// Per-session state shared by the coordinator and task handler
pub struct SessionRuntime {
    pub session_id: SessionId,
    pub key: SessionKey,
    pub manifest: Mutex<ManifestState>,
}

impl SessionRuntime {
    /// Runtime for a session that has just started
    pub fn fresh(session: &SessionRecord, key: SessionKey, object_store: Arc<dyn ObjectStore>) -> Self {
        let builder = ManifestBuilder::new(
            session.session_id,
            session.access_list.clone(),
            object_store,
        );
        Self {
            session_id: session.session_id,
            key,
            manifest: Mutex::new(ManifestState::new(builder, Vec::new())),
        }
    }

    /// Rebuild after a restart from persisted records
    pub async fn restore(
        session: &SessionRecord,
        chunks: &[ChunkRecord],
        keys: &dyn KeyEffects,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let key = recover_session_key(session, keys).await?;
        let (builder, detached) = ManifestBuilder::from_records(session, chunks, object_store)?;
        debug!(
            session_id = %session.session_id,
            manifested = builder.len(),
            detached = detached.len(),
            uploaded = chunks.iter().filter_map(entry_from_record).count(),
            "Restored session runtime"
        );
        Ok(Self {
            session_id: session.session_id,
            key,
            manifest: Mutex::new(ManifestState::new(builder, detached)),
        })
    }
}

/// Unwrap the session key with the first group secret this identity holds
pub async fn recover_session_key(session: &SessionRecord, keys: &dyn KeyEffects) -> Result<SessionKey> {
    let mut last_error = None;
    for group_id in &session.group_ids {
        let Some(wrapped) = session.access_list.get(group_id) else {
            continue;
        };
        let attempt = match keys.group_secret(group_id).await {
            Ok(secret) => unwrap_session_key(wrapped, &secret, &session.session_id, group_id),
            Err(e) => Err(e),
        };
        match attempt {
            Ok(key) => return Ok(key),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        CairnError::access_denied(format!(
            "No usable group key for session {}",
            session.session_id
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cairn_core::{build_root, Hash32, ObjectAddress};
    use proptest::prelude::*;

    struct NoStore;

    #[async_trait]
    impl ObjectStore for NoStore {
        async fn put(&self, _bytes: Vec<u8>) -> Result<ObjectAddress> {
            Err(CairnError::upload("unused"))
        }
        async fn get(&self, address: &ObjectAddress) -> Result<Vec<u8>> {
            Err(CairnError::not_found(address.to_string()))
        }
    }

    fn entry(index: u32) -> ChunkEntry {
        ChunkEntry {
            index,
            raw_hash: Hash32::from_bytes(&index.to_be_bytes()),
            cipher_hash: Hash32::from_bytes(&(index ^ 0xffff).to_be_bytes()),
            iv: [0; 12],
            object_address: ObjectAddress::for_content(&index.to_le_bytes()),
            captured_at: 10_000 * u64::from(index),
        }
    }

    fn state() -> ManifestState {
        let builder = ManifestBuilder::new(SessionId::new(), BTreeMap::new(), Arc::new(NoStore));
        ManifestState::new(builder, Vec::new())
    }

    #[test]
    fn test_gap_holds_back_later_chunks() {
        let mut state = state();
        assert!(state.accept(entry(1)).unwrap().is_empty());
        assert!(state.accept(entry(2)).unwrap().is_empty());
        assert_eq!(state.detached_count(), 2);
        assert_eq!(state.accept(entry(0)).unwrap(), vec![0, 1, 2]);
        assert_eq!(state.detached_count(), 0);
        assert!(state.contains(2));
        assert!(state.accept(entry(1)).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_completion_order_does_not_change_root(
            order in (1u32..24).prop_flat_map(|n| Just((0..n).collect::<Vec<u32>>()).prop_shuffle())
        ) {
            let mut state = state();
            let mut appended = Vec::new();
            for index in &order {
                appended.extend(state.accept(entry(*index)).unwrap());
            }
            let n = order.len() as u32;
            prop_assert_eq!(appended, (0..n).collect::<Vec<_>>());
            let leaves: Vec<Hash32> = (0..n).map(|i| entry(i).leaf().hash()).collect();
            prop_assert_eq!(state.builder.root(), build_root(&leaves));
        }
    }
}

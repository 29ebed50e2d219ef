//! Typed access to session, chunk and payload records
//!
//! Key layout in the durable store:
//!
//! - `session/{session_id}`: [`SessionRecord`]
//! - `chunk/{session_id}/{index:010}`: [`ChunkRecord`]
//! - `payload/{session_id}/{index:010}`: [`CapturedPayload`] until confirmed
//!
//! The payload is the first thing written for a captured segment. A payload
//! with no chunk record beside it is a capture whose bookkeeping was cut off,
//! and [`RecordStore::payloads_for`] lets restart recovery rebuild it.
//!
//! Read-modify-write of one record goes through [`RecordStore::lock`] so
//! concurrent status transitions on the same record never lose an update.
//! Different records are written independently.

use cairn_core::effects::DurableStore;
use cairn_core::serialization::to_record_bytes;
use cairn_core::{CairnError, CapturedPayload, ChunkRecord, Result, SessionId, SessionRecord};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

const SESSION_PREFIX: &str = "session/";
const CHUNK_PREFIX: &str = "chunk/";
const PAYLOAD_PREFIX: &str = "payload/";

/// Durable key of a session record
pub fn session_key(session_id: &SessionId) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

/// Durable key of a chunk record
pub fn chunk_key(session_id: &SessionId, index: u32) -> String {
    format!("{CHUNK_PREFIX}{session_id}/{index:010}")
}

/// Durable key of a chunk's raw payload
pub fn payload_key(session_id: &SessionId, index: u32) -> String {
    format!("{PAYLOAD_PREFIX}{session_id}/{index:010}")
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| CairnError::store_corruption(format!("Undecodable record {key}: {e}")))
}

/// Repository over the durable store
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn DurableStore>,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RecordStore {
    /// Wrap a durable store
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Exclusive access to the record at `key` until the guard drops
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn forget_locks(&self, prefix: &str) {
        self.locks.lock().retain(|k, _| !k.starts_with(prefix));
    }

    async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    // -- sessions --------------------------------------------------------

    /// Write a session record
    pub async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        self.store
            .put(&session_key(&record.session_id), to_record_bytes(record)?)
            .await
    }

    /// Read a session record
    pub async fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        self.get_typed(&session_key(session_id)).await
    }

    /// Read a session record that must exist
    pub async fn require_session(&self, session_id: &SessionId) -> Result<SessionRecord> {
        self.get_session(session_id)
            .await?
            .ok_or_else(|| CairnError::not_found(format!("Unknown session {session_id}")))
    }

    /// Apply `f` to a session record under its lock and persist the result
    pub async fn update_session<F, R>(&self, session_id: &SessionId, f: F) -> Result<R>
    where
        F: FnOnce(&mut SessionRecord) -> Result<R>,
    {
        let _guard = self.lock(&session_key(session_id)).await;
        let mut record = self.require_session(session_id).await?;
        let out = f(&mut record)?;
        self.put_session(&record).await?;
        Ok(out)
    }

    /// Every session record
    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.store
            .scan(SESSION_PREFIX)
            .await?
            .into_iter()
            .map(|(key, bytes)| decode(&key, &bytes))
            .collect()
    }

    /// Remove a session with all its chunk records and payloads
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<()> {
        let chunk_prefix = format!("{CHUNK_PREFIX}{session_id}/");
        let payload_prefix = format!("{PAYLOAD_PREFIX}{session_id}/");
        for prefix in [&chunk_prefix, &payload_prefix] {
            for (key, _) in self.store.scan(prefix).await? {
                self.store.delete(&key).await?;
            }
        }
        self.store.delete(&session_key(session_id)).await?;
        self.forget_locks(&chunk_prefix);
        self.forget_locks(&session_key(session_id));
        Ok(())
    }

    // -- chunks ----------------------------------------------------------

    /// Write a chunk record
    pub async fn put_chunk(&self, record: &ChunkRecord) -> Result<()> {
        self.store
            .put(
                &chunk_key(&record.session_id, record.index),
                to_record_bytes(record)?,
            )
            .await
    }

    /// Read a chunk record
    pub async fn get_chunk(&self, session_id: &SessionId, index: u32) -> Result<Option<ChunkRecord>> {
        self.get_typed(&chunk_key(session_id, index)).await
    }

    /// Apply `f` to a chunk record under its lock and persist the result
    pub async fn update_chunk<F, R>(&self, session_id: &SessionId, index: u32, f: F) -> Result<R>
    where
        F: FnOnce(&mut ChunkRecord) -> Result<R>,
    {
        let _guard = self.lock(&chunk_key(session_id, index)).await;
        let mut record = self.get_chunk(session_id, index).await?.ok_or_else(|| {
            CairnError::not_found(format!("Unknown chunk {index} of session {session_id}"))
        })?;
        let out = f(&mut record)?;
        self.put_chunk(&record).await?;
        Ok(out)
    }

    /// Chunk records of a session in index order
    pub async fn chunks_for(&self, session_id: &SessionId) -> Result<Vec<ChunkRecord>> {
        self.store
            .scan(&format!("{CHUNK_PREFIX}{session_id}/"))
            .await?
            .into_iter()
            .map(|(key, bytes)| decode(&key, &bytes))
            .collect()
    }

    // -- payloads --------------------------------------------------------

    /// Persist a captured segment
    pub async fn put_payload(
        &self,
        session_id: &SessionId,
        index: u32,
        payload: &CapturedPayload,
    ) -> Result<()> {
        self.store
            .put(&payload_key(session_id, index), payload.encode()?)
            .await
    }

    /// Read a captured segment
    pub async fn get_payload(
        &self,
        session_id: &SessionId,
        index: u32,
    ) -> Result<Option<CapturedPayload>> {
        match self.store.get(&payload_key(session_id, index)).await? {
            Some(bytes) => CapturedPayload::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Payloads still held for a session, in index order
    pub async fn payloads_for(&self, session_id: &SessionId) -> Result<Vec<(u32, CapturedPayload)>> {
        let prefix = format!("{PAYLOAD_PREFIX}{session_id}/");
        self.store
            .scan(&prefix)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                let index = key[prefix.len()..].parse::<u32>().map_err(|e| {
                    CairnError::store_corruption(format!("Bad payload key {key}: {e}"))
                })?;
                Ok((index, CapturedPayload::decode(&bytes)?))
            })
            .collect()
    }

    /// Drop raw segment bytes once a ledger anchor covers the chunk
    pub async fn delete_payload(&self, session_id: &SessionId, index: u32) -> Result<bool> {
        self.store.delete(&payload_key(session_id, index)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{ChunkStatus, GroupId};
    use cairn_effects::MemoryDurableStore;
    use std::collections::BTreeMap;

    fn session() -> SessionRecord {
        SessionRecord::new(
            SessionId::new(),
            vec![GroupId::new("family")],
            BTreeMap::new(),
            1_000,
        )
    }

    fn payload(bytes: &[u8]) -> CapturedPayload {
        CapturedPayload {
            captured_at: 1_000,
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let records = RecordStore::new(Arc::new(MemoryDurableStore::new()));
        let rec = session();
        let id = rec.session_id;
        records.put_session(&rec).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let records = records.clone();
            handles.push(tokio::spawn(async move {
                records
                    .update_session(&id, |s| {
                        s.chunk_count += 1;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(records.require_session(&id).await.unwrap().chunk_count, 20);
    }

    #[tokio::test]
    async fn test_chunks_listed_in_index_order() {
        let records = RecordStore::new(Arc::new(MemoryDurableStore::new()));
        let id = SessionId::new();
        for index in [10, 2, 0, 1] {
            records
                .put_chunk(&ChunkRecord::captured(id, index, 4, 0))
                .await
                .unwrap();
        }
        let indices: Vec<u32> = records
            .chunks_for(&id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 10]);
    }

    #[tokio::test]
    async fn test_payloads_listed_with_their_index() {
        let records = RecordStore::new(Arc::new(MemoryDurableStore::new()));
        let id = SessionId::new();
        records.put_payload(&id, 3, &payload(b"three")).await.unwrap();
        records.put_payload(&id, 0, &payload(b"zero")).await.unwrap();
        records
            .put_payload(&SessionId::new(), 1, &payload(b"other"))
            .await
            .unwrap();

        let payloads = records.payloads_for(&id).await.unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].0, 0);
        assert_eq!(payloads[1], (3, payload(b"three")));
        assert_eq!(
            records.get_payload(&id, 0).await.unwrap(),
            Some(payload(b"zero"))
        );
    }

    #[tokio::test]
    async fn test_delete_session_removes_everything() {
        let store = MemoryDurableStore::new();
        let records = RecordStore::new(Arc::new(store.clone()));
        let rec = session();
        let id = rec.session_id;
        records.put_session(&rec).await.unwrap();
        records.put_chunk(&ChunkRecord::captured(id, 0, 3, 0)).await.unwrap();
        records.put_payload(&id, 0, &payload(b"raw")).await.unwrap();

        let other = session();
        records.put_session(&other).await.unwrap();

        records.delete_session(&id).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert!(store
            .get(&session_key(&other.session_id))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_garbage_record_is_store_corruption() {
        let store = MemoryDurableStore::new();
        let records = RecordStore::new(Arc::new(store.clone()));
        let id = SessionId::new();
        store.insert_raw(&chunk_key(&id, 0), b"not json".to_vec()).await;
        store.insert_raw(&payload_key(&id, 0), b"not cbor".to_vec()).await;
        assert!(matches!(
            records.get_chunk(&id, 0).await,
            Err(CairnError::StoreCorruption { .. })
        ));
        assert!(matches!(
            records.payloads_for(&id).await,
            Err(CairnError::StoreCorruption { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_chunk_applies_transition() {
        let records = RecordStore::new(Arc::new(MemoryDurableStore::new()));
        let id = SessionId::new();
        records.put_chunk(&ChunkRecord::captured(id, 0, 3, 0)).await.unwrap();
        let changed = records
            .update_chunk(&id, 0, |c| c.advance(ChunkStatus::Failed))
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(
            records.get_chunk(&id, 0).await.unwrap().unwrap().status,
            ChunkStatus::Failed
        );
    }
}

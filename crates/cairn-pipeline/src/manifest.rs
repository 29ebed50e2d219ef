//! Incremental manifest construction and publication

use cairn_core::crypto::WrappedKey;
use cairn_core::effects::ObjectStore;
use cairn_core::types::MANIFEST_FORMAT_VERSION;
use cairn_core::{
    CairnError, ChunkEntry, ChunkRecord, GroupId, Hash32, IntegrityTree, ManifestPointer,
    ManifestStatus, ManifestVersion, ObjectAddress, Result, SessionId, SessionRecord,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Cumulative chunk list and integrity root of one session
///
/// `add_chunk` only accepts the next index, so the tree always holds a
/// contiguous prefix `0..len`. Every prefix root is kept so any earlier
/// version can be re-serialized bit-for-bit.
pub struct ManifestBuilder {
    session_id: SessionId,
    access_list: BTreeMap<GroupId, WrappedKey>,
    entries: Vec<ChunkEntry>,
    tree: IntegrityTree,
    roots: Vec<Hash32>,
    sealed_total: Option<u32>,
    latest: Option<ManifestPointer>,
    object_store: Arc<dyn ObjectStore>,
}

impl ManifestBuilder {
    /// Empty builder for a session with a fixed access list
    pub fn new(
        session_id: SessionId,
        access_list: BTreeMap<GroupId, WrappedKey>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            session_id,
            access_list,
            entries: Vec::new(),
            tree: IntegrityTree::new(),
            roots: Vec::new(),
            sealed_total: None,
            latest: None,
            object_store,
        }
    }

    /// Rebuild from persisted records after a restart
    ///
    /// Adds the contiguous uploaded prefix; uploaded chunks beyond the first
    /// gap are returned so the caller can add them once the gap fills.
    pub fn from_records(
        session: &SessionRecord,
        chunks: &[ChunkRecord],
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<(Self, Vec<ChunkEntry>)> {
        let mut builder = Self::new(
            session.session_id,
            session.access_list.clone(),
            object_store,
        );
        let mut detached = Vec::new();
        for chunk in chunks {
            let Some(entry) = entry_from_record(chunk) else {
                continue;
            };
            if entry.index as usize == builder.len() {
                builder.add_chunk(entry)?;
            } else {
                detached.push(entry);
            }
        }
        if session.ended_at.is_some() {
            builder.seal(session.chunk_count);
        }
        builder.latest = session.latest_manifest().cloned();
        Ok((builder, detached))
    }

    /// Chunks added so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no chunk has been added
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current integrity root
    pub fn root(&self) -> Hash32 {
        self.tree.root()
    }

    /// Root over the first `count` chunks
    pub fn root_at(&self, count: u32) -> Option<Hash32> {
        match count {
            0 => Some(Hash32::ZERO),
            n => self.roots.get(n as usize - 1).copied(),
        }
    }

    /// Most recently published version
    pub fn latest(&self) -> Option<&ManifestPointer> {
        self.latest.as_ref()
    }

    /// Append the next chunk and return the new root
    pub fn add_chunk(&mut self, entry: ChunkEntry) -> Result<Hash32> {
        if entry.index as usize != self.entries.len() {
            return Err(CairnError::invalid(format!(
                "Manifest expects chunk {}, got {}",
                self.entries.len(),
                entry.index
            )));
        }
        let root = self.tree.insert(entry.leaf().hash());
        self.roots.push(root);
        self.entries.push(entry);
        Ok(root)
    }

    /// Record the final chunk count once capture has ended
    pub fn seal(&mut self, total: u32) {
        self.sealed_total = Some(total);
    }

    /// Total chunk count if capture has ended
    pub fn sealed_total(&self) -> Option<u32> {
        self.sealed_total
    }

    /// The version covering the first `count` chunks
    pub fn version_at(&self, count: u32) -> Result<ManifestVersion> {
        let root = self.root_at(count).ok_or_else(|| {
            CairnError::invalid(format!(
                "Manifest has {} chunks, cannot build version {count}",
                self.entries.len()
            ))
        })?;
        let status = if self.sealed_total == Some(count) {
            ManifestStatus::Final
        } else {
            ManifestStatus::Recording
        };
        Ok(ManifestVersion {
            format: MANIFEST_FORMAT_VERSION,
            session_id: self.session_id,
            chunks: self.entries[..count as usize].to_vec(),
            integrity_root: root,
            access_list: self.access_list.clone(),
            status,
        })
    }

    /// Serialize the version covering `count` chunks without uploading it
    ///
    /// Lets a caller holding the builder behind a lock release it before the
    /// object-store round trip.
    pub fn encode_at(&self, count: u32) -> Result<EncodedManifest> {
        let version = self.version_at(count)?;
        Ok(EncodedManifest {
            chunk_count: count,
            integrity_root: version.integrity_root,
            status: version.status,
            bytes: version.encode()?,
        })
    }

    /// Note a version uploaded outside the builder
    pub fn note_published(&mut self, pointer: ManifestPointer) {
        let newer = match &self.latest {
            None => true,
            Some(latest) if latest.chunk_count == pointer.chunk_count => {
                pointer.supersedes(latest)
            }
            Some(latest) => latest.chunk_count < pointer.chunk_count,
        };
        if newer {
            self.latest = Some(pointer);
        }
    }

    /// Serialize and upload the current state
    pub async fn publish(&mut self) -> Result<ManifestPointer> {
        self.publish_at(self.entries.len() as u32).await
    }

    /// Serialize and upload the version covering `count` chunks
    ///
    /// Equal state yields equal bytes and therefore the same address.
    pub async fn publish_at(&mut self, count: u32) -> Result<ManifestPointer> {
        let encoded = self.encode_at(count)?;
        let status = encoded.status;
        let address = self.object_store.put(encoded.bytes).await?;
        debug!(session_id = %self.session_id, chunk_count = count, %address, "Published manifest");

        let pointer = ManifestPointer {
            chunk_count: count,
            address,
            status,
        };
        self.note_published(pointer.clone());
        Ok(pointer)
    }
}

/// A manifest version serialized for upload
#[derive(Debug, Clone)]
pub struct EncodedManifest {
    /// Chunks listed
    pub chunk_count: u32,
    /// Root over those chunks
    pub integrity_root: Hash32,
    /// Capture state baked into the bytes
    pub status: ManifestStatus,
    /// Canonical CBOR
    pub bytes: Vec<u8>,
}

impl EncodedManifest {
    /// Pointer to this version once stored at `address`
    pub fn pointer(&self, address: ObjectAddress) -> ManifestPointer {
        ManifestPointer {
            chunk_count: self.chunk_count,
            address,
            status: self.status,
        }
    }
}

/// Manifest entry for an uploaded chunk record
pub fn entry_from_record(record: &ChunkRecord) -> Option<ChunkEntry> {
    if !record.status.is_uploaded() {
        return None;
    }
    let outcome = record.outcome.as_ref()?;
    Some(ChunkEntry {
        index: record.index,
        raw_hash: outcome.raw_hash,
        cipher_hash: outcome.cipher_hash,
        iv: outcome.iv,
        object_address: outcome.object_address.clone(),
        captured_at: record.captured_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cairn_core::{build_root, ChunkOutcome, ChunkStatus};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CountingStore {
        objects: Mutex<HashMap<ObjectAddress, Vec<u8>>>,
        puts: Mutex<usize>,
    }

    #[async_trait]
    impl ObjectStore for CountingStore {
        async fn put(&self, bytes: Vec<u8>) -> Result<ObjectAddress> {
            *self.puts.lock() += 1;
            let address = ObjectAddress::for_content(&bytes);
            self.objects.lock().insert(address.clone(), bytes);
            Ok(address)
        }

        async fn get(&self, address: &ObjectAddress) -> Result<Vec<u8>> {
            self.objects
                .lock()
                .get(address)
                .cloned()
                .ok_or_else(|| CairnError::not_found(address.to_string()))
        }
    }

    fn entry(index: u32) -> ChunkEntry {
        ChunkEntry {
            index,
            raw_hash: Hash32::from_bytes(format!("raw-{index}").as_bytes()),
            cipher_hash: Hash32::from_bytes(format!("cipher-{index}").as_bytes()),
            iv: [index as u8; 12],
            object_address: ObjectAddress::for_content(format!("cipher-{index}").as_bytes()),
            captured_at: 1_000 + u64::from(index),
        }
    }

    fn builder(store: Arc<CountingStore>) -> ManifestBuilder {
        ManifestBuilder::new(SessionId::new(), BTreeMap::new(), store)
    }

    #[tokio::test]
    async fn test_publish_is_idempotent() {
        let store = Arc::new(CountingStore::default());
        let mut b = builder(store.clone());
        b.add_chunk(entry(0)).unwrap();
        b.add_chunk(entry(1)).unwrap();

        let first = b.publish().await.unwrap();
        let second = b.publish().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.chunk_count, 2);
        assert_eq!(store.objects.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_versions_grow_and_stay_retrievable() {
        let store = Arc::new(CountingStore::default());
        let mut b = builder(store.clone());
        let mut pointers = Vec::new();
        for i in 0..4 {
            b.add_chunk(entry(i)).unwrap();
            pointers.push(b.publish().await.unwrap());
        }

        for (i, pointer) in pointers.iter().enumerate() {
            let bytes = store.get(&pointer.address).await.unwrap();
            let version = ManifestVersion::decode(&bytes).unwrap();
            assert_eq!(version.chunks.len(), i + 1);
            assert_eq!(version.recompute_root(), version.integrity_root);
        }
        assert_eq!(b.latest().unwrap().chunk_count, 4);
    }

    #[tokio::test]
    async fn test_version_at_reproduces_earlier_publish() {
        let store = Arc::new(CountingStore::default());
        let mut b = builder(store.clone());
        b.add_chunk(entry(0)).unwrap();
        let early = b.publish().await.unwrap();
        b.add_chunk(entry(1)).unwrap();
        b.add_chunk(entry(2)).unwrap();

        let latest = b.publish().await.unwrap();
        let replayed = b.publish_at(1).await.unwrap();
        assert_eq!(replayed, early);
        assert_eq!(b.latest(), Some(&latest));
    }

    #[tokio::test]
    async fn test_encode_at_matches_published_bytes() {
        let store = Arc::new(CountingStore::default());
        let mut b = builder(store.clone());
        b.add_chunk(entry(0)).unwrap();
        b.add_chunk(entry(1)).unwrap();

        let encoded = b.encode_at(2).unwrap();
        assert_eq!(*store.puts.lock(), 0);
        assert_eq!(encoded.integrity_root, b.root());
        let pointer = b.publish_at(2).await.unwrap();
        assert_eq!(pointer, encoded.pointer(ObjectAddress::for_content(&encoded.bytes)));
    }

    #[tokio::test]
    async fn test_late_recording_version_keeps_final_latest() {
        let store = Arc::new(CountingStore::default());
        let mut b = builder(store.clone());
        b.add_chunk(entry(0)).unwrap();
        let before_end = b.encode_at(1).unwrap();

        b.seal(1);
        let final_pointer = b.publish().await.unwrap();
        assert_eq!(final_pointer.status, ManifestStatus::Final);

        let address = store.put(before_end.bytes.clone()).await.unwrap();
        b.note_published(before_end.pointer(address));
        assert_eq!(b.latest(), Some(&final_pointer));
    }

    #[test]
    fn test_out_of_order_add_rejected() {
        let mut b = builder(Arc::new(CountingStore::default()));
        assert!(b.add_chunk(entry(1)).is_err());
        b.add_chunk(entry(0)).unwrap();
        assert!(b.add_chunk(entry(0)).is_err());
    }

    #[test]
    fn test_roots_match_batch_construction() {
        let mut b = builder(Arc::new(CountingStore::default()));
        let leaves: Vec<Hash32> = (0..7).map(|i| entry(i).leaf().hash()).collect();
        for i in 0..7 {
            b.add_chunk(entry(i)).unwrap();
        }
        for count in 0..=7u32 {
            assert_eq!(
                b.root_at(count).unwrap(),
                build_root(&leaves[..count as usize])
            );
        }
        assert!(b.root_at(8).is_none());
    }

    #[test]
    fn test_final_status_only_for_sealed_count() {
        let mut b = builder(Arc::new(CountingStore::default()));
        b.add_chunk(entry(0)).unwrap();
        b.add_chunk(entry(1)).unwrap();
        b.seal(2);
        assert_eq!(b.version_at(1).unwrap().status, ManifestStatus::Recording);
        assert_eq!(b.version_at(2).unwrap().status, ManifestStatus::Final);
    }

    #[test]
    fn test_rebuild_detaches_chunks_after_gap() {
        let session = SessionRecord::new(SessionId::new(), vec![], BTreeMap::new(), 0);
        let mut records = Vec::new();
        for index in 0..4u32 {
            let mut rec = ChunkRecord::captured(session.session_id, index, 1, 1_000 + u64::from(index));
            if index != 1 {
                let e = entry(index);
                rec.mark_uploaded(
                    ChunkOutcome {
                        raw_hash: e.raw_hash,
                        cipher_hash: e.cipher_hash,
                        iv: e.iv,
                        object_address: e.object_address,
                    },
                    2_000,
                )
                .unwrap();
            }
            records.push(rec);
        }
        assert_eq!(records[1].status, ChunkStatus::Pending);

        let (b, detached) =
            ManifestBuilder::from_records(&session, &records, Arc::new(CountingStore::default()))
                .unwrap();
        assert_eq!(b.len(), 1);
        let detached: Vec<u32> = detached.iter().map(|e| e.index).collect();
        assert_eq!(detached, vec![2, 3]);
    }
}

//! Per-chunk hash, encrypt and upload

use cairn_core::crypto::{derive_chunk_key, generate_iv, seal_chunk, SessionKey};
use cairn_core::effects::ObjectStore;
use cairn_core::{ChunkOutcome, Hash32, Result};
use std::sync::Arc;
use tracing::debug;

/// Turns one raw segment into an uploaded ciphertext
///
/// Apart from the upload the work is a pure function of its inputs, so a
/// replayed task after a crash produces an equivalent outcome (a fresh IV
/// means fresh ciphertext, but the raw hash and index are unchanged).
/// Upload failures are returned as-is; retrying is the queue's job.
#[derive(Clone)]
pub struct ChunkProcessor {
    object_store: Arc<dyn ObjectStore>,
}

impl ChunkProcessor {
    /// Processor uploading to `object_store`
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self { object_store }
    }

    /// Hash, derive the chunk key, seal and upload
    pub async fn process(
        &self,
        session_key: &SessionKey,
        index: u32,
        raw: &[u8],
    ) -> Result<ChunkOutcome> {
        let raw_hash = Hash32::from_bytes(raw);
        let chunk_key = derive_chunk_key(session_key, index)?;
        let iv = generate_iv();
        let ciphertext = seal_chunk(&chunk_key, &iv, raw)?;
        let cipher_hash = Hash32::from_bytes(&ciphertext);

        let object_address = self.object_store.put(ciphertext).await?;
        debug!(index, address = %object_address, "Uploaded chunk ciphertext");

        Ok(ChunkOutcome {
            raw_hash,
            cipher_hash,
            iv,
            object_address,
        })
    }
}

//! Effects of queued tasks
//!
//! Every branch is safe to replay: a task interrupted by a crash runs again
//! after recovery and must leave the same durable state as one clean run.

use super::context::PipelineContext;
use crate::config::AnchorPolicy;
use crate::manifest::entry_from_record;
use crate::queue::TaskHandler;
use crate::records::payload_key;
use async_trait::async_trait;
use cairn_core::crypto::SessionKey;
use cairn_core::effects::AnchorRequest;
use cairn_core::{
    CairnError, CapturedPayload, ChunkEntry, ChunkStatus, Hash32, ObjectAddress, QueueTask, Result,
    SessionId, TaskKind,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Dispatches queue tasks to the upload, manifest and anchor steps
pub(crate) struct PipelineHandler {
    ctx: Arc<PipelineContext>,
}

impl PipelineHandler {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    async fn upload_chunk(&self, task: &QueueTask, index: u32) -> Result<()> {
        let session_id = task.session_id;
        let runtime = self.ctx.runtime(&session_id).await?;
        let entry = match self.ctx.records.get_chunk(&session_id, index).await? {
            Some(record) => match entry_from_record(&record) {
                Some(entry) => entry,
                None => self.process_payload(task, index, &runtime.key).await?,
            },
            None => {
                return Err(CairnError::store_corruption(format!(
                    "Chunk record {index} of session {session_id} is missing"
                )))
            }
        };

        let appended = {
            let mut state = runtime.manifest.lock().await;
            if state.contains(index) {
                vec![index]
            } else {
                let appended = state.accept(entry)?;
                if appended.is_empty() {
                    debug!(
                        %session_id,
                        index,
                        waiting = state.detached_count(),
                        "Chunk uploaded ahead of a gap"
                    );
                }
                appended
            }
        };
        for appended_index in appended {
            self.ensure_manifest_task(&session_id, appended_index + 1)
                .await?;
        }
        Ok(())
    }

    async fn process_payload(
        &self,
        task: &QueueTask,
        index: u32,
        key: &SessionKey,
    ) -> Result<ChunkEntry> {
        let session_id = task.session_id;
        let payload_ref = task
            .payload_ref
            .clone()
            .unwrap_or_else(|| payload_key(&session_id, index));
        let stored = self
            .ctx
            .effects
            .durable_store
            .get(&payload_ref)
            .await?
            .ok_or_else(|| {
                CairnError::store_corruption(format!(
                    "Payload of chunk {index} of session {session_id} is missing"
                ))
            })?;
        let payload = CapturedPayload::decode(&stored)?;

        let outcome = self.ctx.processor.process(key, index, &payload.bytes).await?;
        let now = self.ctx.now_ms();
        let attempt = task.attempt;
        let record = self
            .ctx
            .records
            .update_chunk(&session_id, index, |c| {
                if c.status == ChunkStatus::Failed {
                    c.advance(ChunkStatus::Pending)?;
                }
                c.mark_uploaded(outcome, now)?;
                c.retry_count = attempt;
                Ok(c.clone())
            })
            .await?;
        entry_from_record(&record).ok_or_else(|| {
            CairnError::internal(format!("Chunk {index} has no outcome after upload"))
        })
    }

    async fn ensure_manifest_task(&self, session_id: &SessionId, chunk_count: u32) -> Result<()> {
        let session = self.ctx.records.require_session(session_id).await?;
        if session
            .manifests
            .iter()
            .any(|m| m.chunk_count == chunk_count)
        {
            return Ok(());
        }
        let kind = TaskKind::UploadManifest { chunk_count };
        if self
            .ctx
            .queue
            .any_known(|t| &t.session_id == session_id && t.kind == kind)
        {
            return Ok(());
        }
        self.ctx.queue.enqueue(*session_id, kind, None).await?;
        Ok(())
    }

    /// Upload the version covering `chunk_count` chunks and queue its anchor
    ///
    /// The builder lock is held only to serialize the version, never across
    /// the object-store round trip, so uploads of other chunks keep landing
    /// while a slow manifest put is in flight.
    async fn upload_manifest(&self, session_id: SessionId, chunk_count: u32) -> Result<()> {
        let runtime = self.ctx.runtime(&session_id).await?;
        let mut encoded = {
            let state = runtime.manifest.lock().await;
            if (chunk_count as usize) > state.builder.len() {
                return Err(CairnError::invalid(format!(
                    "Manifest of session {session_id} holds {} chunks, not {chunk_count}",
                    state.builder.len()
                )));
            }
            state.builder.encode_at(chunk_count)?
        };
        let root = encoded.integrity_root;
        let address = self
            .ctx
            .effects
            .object_store
            .put(std::mem::take(&mut encoded.bytes))
            .await?;
        let pointer = encoded.pointer(address);
        runtime
            .manifest
            .lock()
            .await
            .builder
            .note_published(pointer.clone());
        debug!(%session_id, chunk_count, address = %pointer.address, status = ?pointer.status, "Published manifest");

        let anchored = self
            .ctx
            .records
            .update_session(&session_id, |s| {
                s.record_manifest(pointer.clone());
                Ok(s.anchored_chunk_count)
            })
            .await?;

        for index in (0..chunk_count).rev() {
            let moved = self
                .ctx
                .records
                .update_chunk(&session_id, index, |c| {
                    if c.status == ChunkStatus::Uploaded {
                        c.advance(ChunkStatus::Manifested)
                    } else {
                        Ok(false)
                    }
                })
                .await?;
            if !moved {
                break;
            }
        }

        if anchored >= chunk_count {
            debug!(%session_id, chunk_count, anchored, "Manifest already covered by an anchor");
            return Ok(());
        }
        let kind = TaskKind::AnchorCommit {
            chunk_count,
            integrity_root: root,
            manifest_address: pointer.address,
        };
        if self
            .ctx
            .queue
            .any_outstanding(|t| t.session_id == session_id && t.kind == kind)
        {
            return Ok(());
        }
        self.ctx.queue.enqueue(session_id, kind, None).await?;
        Ok(())
    }

    async fn anchor_commit(
        &self,
        session_id: SessionId,
        chunk_count: u32,
        integrity_root: Hash32,
        manifest_address: &ObjectAddress,
    ) -> Result<()> {
        let lock = self.ctx.anchor_lock(&session_id);
        let _guard = lock.lock().await;

        let session = self.ctx.records.require_session(&session_id).await?;
        if session.anchored_chunk_count >= chunk_count {
            warn!(
                %session_id,
                chunk_count,
                anchored = session.anchored_chunk_count,
                "Anchor superseded by a newer commit"
            );
            return self
                .record_anchor(&session_id, session.anchored_chunk_count, integrity_root)
                .await;
        }

        if self.ctx.config.anchor.policy == AnchorPolicy::LatestOnly
            && self.ctx.queue.any_outstanding(|t| {
                t.session_id == session_id
                    && matches!(t.kind, TaskKind::AnchorCommit { chunk_count: c, .. } if c > chunk_count)
            })
        {
            debug!(%session_id, chunk_count, "Anchor coalesced into a newer queued anchor");
            return Ok(());
        }

        if let Some(existing) = self.ctx.effects.ledger.latest_anchor(&session_id).await? {
            if existing.chunk_count >= chunk_count {
                warn!(
                    %session_id,
                    chunk_count,
                    ledger_count = existing.chunk_count,
                    "Ledger already holds a covering anchor"
                );
                return self
                    .record_anchor(&session_id, existing.chunk_count, existing.integrity_root)
                    .await;
            }
        }

        let receipt = self
            .ctx
            .effects
            .ledger
            .commit(AnchorRequest {
                session_id,
                integrity_root,
                manifest_address: manifest_address.clone(),
                chunk_count,
                group_ids: session.group_ids.clone(),
            })
            .await?;
        info!(%session_id, chunk_count, tx_id = %receipt.tx_id, root = %integrity_root, "Anchored integrity root");
        self.record_anchor(&session_id, chunk_count, integrity_root)
            .await
    }

    /// Note a ledger anchor and confirm the chunks it covers
    async fn record_anchor(
        &self,
        session_id: &SessionId,
        chunk_count: u32,
        integrity_root: Hash32,
    ) -> Result<()> {
        let anchored = self
            .ctx
            .records
            .update_session(session_id, |s| {
                if chunk_count > s.anchored_chunk_count {
                    s.anchored_chunk_count = chunk_count;
                    s.anchored_root = Some(integrity_root);
                }
                Ok(s.anchored_chunk_count)
            })
            .await?;

        // Confirmed chunks always form a prefix, so a crash part way through
        // leaves the rest to be found by the next downward scan
        let mut unconfirmed = Vec::new();
        for index in (0..anchored).rev() {
            match self.ctx.records.get_chunk(session_id, index).await? {
                Some(c) if c.status != ChunkStatus::Confirmed => unconfirmed.push(index),
                _ => break,
            }
        }

        let now = self.ctx.now_ms();
        for index in unconfirmed.into_iter().rev() {
            self.ctx
                .records
                .update_chunk(session_id, index, |c| {
                    if c.status == ChunkStatus::Uploaded {
                        c.advance(ChunkStatus::Manifested)?;
                    }
                    if c.advance(ChunkStatus::Confirmed)? {
                        c.confirmed_at = Some(now);
                    }
                    Ok(())
                })
                .await?;
            self.ctx.records.delete_payload(session_id, index).await?;
        }
        debug!(%session_id, anchored, "Confirmed anchored chunks");
        self.ctx.refresh_progress(session_id).await
    }
}

#[async_trait]
impl TaskHandler for PipelineHandler {
    async fn execute(&self, task: &QueueTask) -> Result<()> {
        match &task.kind {
            TaskKind::UploadChunk { index } => self.upload_chunk(task, *index).await,
            TaskKind::UploadManifest { chunk_count } => {
                self.upload_manifest(task.session_id, *chunk_count).await
            }
            TaskKind::AnchorCommit {
                chunk_count,
                integrity_root,
                manifest_address,
            } => {
                self.anchor_commit(
                    task.session_id,
                    *chunk_count,
                    *integrity_root,
                    manifest_address,
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::context::test_support::{context, effects};
    use crate::session::runtime::SessionRuntime;
    use cairn_core::{ChunkRecord, GroupId, SessionRecord};
    use cairn_testkit::FaultyObjectStore;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn entry(index: u32) -> ChunkEntry {
        ChunkEntry {
            index,
            raw_hash: Hash32::from_bytes(&index.to_be_bytes()),
            cipher_hash: Hash32::from_bytes(&index.to_le_bytes()),
            iv: [0; 12],
            object_address: ObjectAddress::for_content(&index.to_le_bytes()),
            captured_at: 1_000,
        }
    }

    #[tokio::test]
    async fn test_manifest_lock_released_during_upload() {
        let objects = FaultyObjectStore::new();
        let ctx = context(effects(Arc::new(objects.clone()))).await;
        let session = SessionRecord::new(
            SessionId::new(),
            vec![GroupId::new("family")],
            BTreeMap::new(),
            1_000,
        );
        let session_id = session.session_id;
        ctx.records.put_session(&session).await.unwrap();
        ctx.records
            .put_chunk(&ChunkRecord::captured(session_id, 0, 8, 1_000))
            .await
            .unwrap();
        let runtime = ctx.insert_runtime(SessionRuntime::fresh(
            &session,
            SessionKey::generate(),
            ctx.effects.object_store.clone(),
        ));
        runtime.manifest.lock().await.accept(entry(0)).unwrap();

        objects.hold_puts();
        let handler = PipelineHandler::new(ctx.clone());
        let upload = tokio::spawn(async move { handler.upload_manifest(session_id, 1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!upload.is_finished());

        let state = tokio::time::timeout(Duration::from_millis(100), runtime.manifest.lock())
            .await
            .expect("builder is free while the manifest put is held");
        assert!(state.contains(0));
        drop(state);

        objects.release_puts();
        upload.await.unwrap().unwrap();
        let recorded = ctx.records.require_session(&session_id).await.unwrap();
        assert_eq!(recorded.manifests.len(), 1);
        assert!(ctx.queue.any_outstanding(|t| matches!(
            t.kind,
            TaskKind::AnchorCommit { chunk_count: 1, .. }
        )));
    }
}

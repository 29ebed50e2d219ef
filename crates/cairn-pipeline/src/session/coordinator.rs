//! Session lifecycle: start, capture, end and restart recovery

use super::context::{Intake, PipelineContext, PipelineEffects};
use super::handler::PipelineHandler;
use super::runtime::SessionRuntime;
use crate::config::CairnConfig;
use crate::queue::DurableQueue;
use crate::records::payload_key;
use crate::task_registry::TaskRegistry;
use cairn_core::crypto::{wrap_session_key, SessionKey};
use cairn_core::{
    CairnError, CapturedPayload, ChunkRecord, ChunkStatus, GroupId, Result, SessionId,
    SessionProgress, SessionRecord, SessionStatus, TaskKind,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Capture cursor of the recording session
struct ActiveCapture {
    session_id: SessionId,
    next_index: u32,
}

/// Entry point of the capture side
///
/// Owns the queue drain loop, the queue event listener and the capture
/// intake; all three stop when the coordinator is shut down or dropped.
///
/// A capture call makes exactly one durable write, the payload, and returns
/// once the store reports it synced. Chunk records, the session's chunk
/// count and the upload task are written afterwards by the intake loop, in
/// capture order. A crash in between leaves a payload without a chunk
/// record, which the next `open` turns back into a pending upload.
pub struct SessionCoordinator {
    ctx: Arc<PipelineContext>,
    active: Mutex<Option<SessionId>>,
    capture: tokio::sync::Mutex<Option<ActiveCapture>>,
    intake: mpsc::UnboundedSender<Intake>,
    tasks: TaskRegistry,
}

impl SessionCoordinator {
    /// Recover persisted state and start draining the queue
    pub async fn open(config: CairnConfig, effects: PipelineEffects) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(DurableQueue::new(
            effects.durable_store.clone(),
            effects.clock.clone(),
            &config.queue,
        ));
        let events = queue.subscribe();
        let ctx = Arc::new(PipelineContext::new(config, effects, queue.clone()));

        queue.recover().await?;
        let mut interrupted = 0;
        for session in ctx.records.list_sessions().await? {
            if recover_session(&ctx, session).await? {
                interrupted += 1;
            }
        }

        let tasks = TaskRegistry::new();
        tasks.spawn_loop("queue-events", ctx.clone().listen(events));
        let (intake, intake_rx) = mpsc::unbounded_channel();
        tasks.spawn_loop("capture-intake", ctx.clone().intake(intake_rx));
        let handler = Arc::new(PipelineHandler::new(ctx.clone()));
        tasks.spawn_loop("queue-drain", queue.drain(handler, tasks.shutdown_signal()));

        info!(
            interrupted,
            queue_depth = ctx.queue.depth(),
            terminal = ctx.queue.terminal_tasks().len(),
            "Session coordinator ready"
        );
        Ok(Self {
            ctx,
            active: Mutex::new(None),
            capture: tokio::sync::Mutex::new(None),
            intake,
            tasks,
        })
    }

    /// Begin a session readable by `groups`
    ///
    /// The session key is wrapped once per group and the record is persisted
    /// before any chunk is accepted; membership is fixed from here on.
    pub async fn start_session(&self, groups: Vec<GroupId>) -> Result<SessionId> {
        if let Some(active) = *self.active.lock() {
            return Err(CairnError::invalid(format!(
                "Session {active} is still recording"
            )));
        }
        let mut group_ids = Vec::with_capacity(groups.len());
        for group in groups {
            if !group_ids.contains(&group) {
                group_ids.push(group);
            }
        }
        if group_ids.is_empty() {
            return Err(CairnError::invalid("A session needs at least one group"));
        }

        let session_id = SessionId::new();
        let key = SessionKey::generate();
        let mut access_list = BTreeMap::new();
        for group_id in &group_ids {
            let secret = self.ctx.effects.keys.group_secret(group_id).await?;
            let wrapped = wrap_session_key(&key, &secret, &session_id, group_id)?;
            access_list.insert(group_id.clone(), wrapped);
        }

        if !self.ctx.config.storage.retain_previous_sessions {
            self.prune_settled_sessions().await?;
        }

        let mut capture = self.capture.lock().await;
        if let Some(other) = capture.as_ref() {
            return Err(CairnError::invalid(format!(
                "Session {} is still recording",
                other.session_id
            )));
        }
        let record = SessionRecord::new(session_id, group_ids, access_list, self.ctx.now_ms());
        self.ctx.records.put_session(&record).await?;
        self.ctx.insert_runtime(SessionRuntime::fresh(
            &record,
            key,
            self.ctx.effects.object_store.clone(),
        ));
        self.ctx
            .progress
            .publish(session_id, SessionProgress::recording());

        *capture = Some(ActiveCapture {
            session_id,
            next_index: 0,
        });
        *self.active.lock() = Some(session_id);
        info!(%session_id, groups = record.group_ids.len(), "Session started");
        Ok(session_id)
    }

    async fn prune_settled_sessions(&self) -> Result<()> {
        for session in self.ctx.records.list_sessions().await? {
            let session_id = session.session_id;
            if !session.status.is_terminal()
                || self.ctx.queue.any_known(|t| t.session_id == session_id)
            {
                continue;
            }
            self.ctx.records.delete_session(&session_id).await?;
            self.ctx.forget_session(&session_id);
            debug!(%session_id, "Pruned settled session");
        }
        Ok(())
    }

    /// Accept the next captured segment of the active session
    pub async fn process_chunk(&self, raw: Vec<u8>) -> Result<u32> {
        let session_id = self
            .active_session()
            .ok_or_else(|| CairnError::invalid("No session is recording"))?;
        self.process_captured(session_id, raw, self.ctx.now_ms())
            .await
    }

    /// Accept a segment for `session_id` captured at `captured_at`
    ///
    /// Assigns the next index and persists the payload; that single write is
    /// the durability point. Returns the assigned index.
    pub async fn process_captured(
        &self,
        session_id: SessionId,
        raw: Vec<u8>,
        captured_at: u64,
    ) -> Result<u32> {
        let mut capture = self.capture.lock().await;
        let cursor = capture
            .as_mut()
            .filter(|c| c.session_id == session_id)
            .ok_or_else(|| CairnError::invalid(format!("Session {session_id} is not recording")))?;
        let index = cursor.next_index;
        let payload = CapturedPayload {
            captured_at,
            bytes: raw,
        };
        self.ctx
            .records
            .put_payload(&session_id, index, &payload)
            .await?;
        cursor.next_index = index + 1;
        drop(capture);

        let admitted = self.intake.send(Intake::Chunk {
            session_id,
            index,
            payload_len: payload.bytes.len() as u64,
            captured_at,
        });
        if admitted.is_err() {
            warn!(%session_id, index, "Capture intake stopped; chunk is admitted on restart");
        }
        debug!(%session_id, index, "Chunk captured");
        Ok(index)
    }

    /// Wait until every chunk captured so far has been admitted
    async fn flush_intake(&self) {
        let (done, ack) = oneshot::channel();
        if self.intake.send(Intake::Flush(done)).is_ok() {
            let _ = ack.await;
        }
    }

    /// Stop recording the active session
    ///
    /// Returns immediately; the session completes once its tasks drain.
    pub async fn end_session(&self) -> Result<SessionId> {
        let session_id = self
            .active_session()
            .ok_or_else(|| CairnError::invalid("No session is recording"))?;
        self.finish_session(&session_id).await?;
        Ok(session_id)
    }

    /// Stop recording `session_id`
    ///
    /// Seals the manifest at the captured total. When every chunk has
    /// already been added, the last version was published as `Recording`,
    /// so the same version is queued again and goes out as `Final`.
    pub async fn finish_session(&self, session_id: &SessionId) -> Result<()> {
        let mut capture = self.capture.lock().await;
        let total = match capture.as_ref() {
            Some(c) if &c.session_id == session_id => c.next_index,
            _ => {
                return Err(CairnError::invalid(format!(
                    "Session {session_id} is not recording"
                )))
            }
        };
        self.flush_intake().await;

        let runtime = self.ctx.runtime(session_id).await?;
        let republish = {
            let mut state = runtime.manifest.lock().await;
            state.builder.seal(total);
            total > 0 && state.builder.len() == total as usize
        };
        if republish {
            self.ctx
                .queue
                .enqueue(
                    *session_id,
                    TaskKind::UploadManifest { chunk_count: total },
                    None,
                )
                .await?;
        }

        let now = self.ctx.now_ms();
        self.ctx
            .records
            .update_session(session_id, |s| {
                s.status = SessionStatus::Uploading;
                s.ended_at = Some(now);
                s.chunk_count = s.chunk_count.max(total);
                Ok(())
            })
            .await?;
        *capture = None;
        {
            let mut active = self.active.lock();
            if active.as_ref() == Some(session_id) {
                *active = None;
            }
        }
        drop(capture);
        info!(%session_id, chunks = total, republish, "Session ended");
        self.ctx.settle(session_id).await
    }

    /// Session currently recording, if any
    pub fn active_session(&self) -> Option<SessionId> {
        *self.active.lock()
    }

    /// Lifecycle state of `session_id`
    pub async fn session_status(&self, session_id: &SessionId) -> Result<SessionStatus> {
        Ok(self.ctx.records.require_session(session_id).await?.status)
    }

    /// Persisted session record
    pub async fn session(&self, session_id: &SessionId) -> Result<SessionRecord> {
        self.ctx.records.require_session(session_id).await
    }

    /// Chunk records of `session_id` in index order
    pub async fn chunks(&self, session_id: &SessionId) -> Result<Vec<ChunkRecord>> {
        self.ctx.records.chunks_for(session_id).await
    }

    /// Progress channel of `session_id`
    pub async fn progress(&self, session_id: &SessionId) -> Result<watch::Receiver<SessionProgress>> {
        if let Some(rx) = self.ctx.progress.subscribe(session_id) {
            return Ok(rx);
        }
        self.ctx.refresh_progress(session_id).await?;
        self.ctx
            .progress
            .subscribe(session_id)
            .ok_or_else(|| CairnError::not_found(format!("Unknown session {session_id}")))
    }

    /// Resolve once `session_id` is terminal with nothing left in the queue
    pub async fn wait_until_settled(&self, session_id: &SessionId) -> Result<SessionProgress> {
        let mut rx = self.progress(session_id).await?;
        let settled = rx
            .wait_for(SessionProgress::is_settled)
            .await
            .map_err(|_| CairnError::internal("Progress channel closed"))?;
        Ok(*settled)
    }

    /// The underlying queue, for operator inspection and retries
    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.ctx.queue
    }

    /// Stop the drain loop, the event listener and the capture intake
    ///
    /// In-flight attempts are abandoned; they replay on the next `open`.
    pub fn shutdown(&self) {
        self.tasks.shutdown();
        info!("Session coordinator stopped");
    }
}

/// Bring one persisted session back after a restart
///
/// Returns whether the session was marked interrupted.
async fn recover_session(ctx: &PipelineContext, session: SessionRecord) -> Result<bool> {
    let session_id = session.session_id;
    let mut chunks = ctx.records.chunks_for(&session_id).await?;

    // Payloads whose chunk record never made it to the store
    let mut rebuilt = 0;
    for (index, payload) in ctx.records.payloads_for(&session_id).await? {
        if chunks.iter().any(|c| c.index == index) {
            continue;
        }
        let record = payload.record(session_id, index);
        ctx.records.put_chunk(&record).await?;
        chunks.push(record);
        rebuilt += 1;
    }
    if rebuilt > 0 {
        chunks.sort_by_key(|c| c.index);
        warn!(%session_id, rebuilt, "Rebuilt chunk records from captured payloads");
    }
    let seen = chunks.last().map_or(0, |c| c.index + 1);

    let interrupted = !session.status.is_terminal();
    if interrupted || seen > session.chunk_count {
        ctx.records
            .update_session(&session_id, |s| {
                if !s.status.is_terminal() {
                    s.status = SessionStatus::Interrupted;
                }
                s.chunk_count = s.chunk_count.max(seen);
                Ok(())
            })
            .await?;
    }
    if interrupted {
        warn!(%session_id, previous = ?session.status, chunks = seen, "Session interrupted by restart");
    }

    for chunk in chunks.iter().filter(|c| c.status == ChunkStatus::Pending) {
        let index = chunk.index;
        let kind = TaskKind::UploadChunk { index };
        if ctx
            .queue
            .any_known(|t| t.session_id == session_id && t.kind == kind)
        {
            continue;
        }
        // Captured but the upload task never reached the store
        ctx.queue
            .enqueue(session_id, kind, Some(payload_key(&session_id, index)))
            .await?;
    }
    ctx.refresh_progress(&session_id).await?;
    Ok(interrupted)
}

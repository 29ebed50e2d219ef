//! State shared between the coordinator, task handler and event listener

use super::progress::ProgressHub;
use super::runtime::SessionRuntime;
use crate::config::CairnConfig;
use crate::processor::ChunkProcessor;
use crate::queue::{DurableQueue, QueueEvent};
use crate::records::{payload_key, RecordStore};
use cairn_core::effects::{DurableStore, KeyEffects, LedgerEffects, ObjectStore, PhysicalTimeEffects};
use cairn_core::{
    ChunkRecord, ChunkStatus, Result, SessionId, SessionProgress, SessionRecord, SessionStatus,
    TaskKind,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Collaborators consumed by the pipeline
#[derive(Clone)]
pub struct PipelineEffects {
    /// Local persistence for records and queue tasks
    pub durable_store: Arc<dyn DurableStore>,
    /// Content-addressed blob store
    pub object_store: Arc<dyn ObjectStore>,
    /// Anchor ledger
    pub ledger: Arc<dyn LedgerEffects>,
    /// Group wrap secrets
    pub keys: Arc<dyn KeyEffects>,
    /// Wall clock
    pub clock: Arc<dyn PhysicalTimeEffects>,
}

/// Work handed from a capture call to the intake loop
pub(crate) enum Intake {
    /// A payload is durable; write its chunk record and queue its upload
    Chunk {
        session_id: SessionId,
        index: u32,
        payload_len: u64,
        captured_at: u64,
    },
    /// Acknowledged once everything sent before it has been handled
    Flush(oneshot::Sender<()>),
}

pub(crate) struct PipelineContext {
    pub config: CairnConfig,
    pub effects: PipelineEffects,
    pub records: RecordStore,
    pub queue: Arc<DurableQueue>,
    pub processor: ChunkProcessor,
    pub progress: ProgressHub,
    runtimes: Mutex<HashMap<SessionId, Arc<SessionRuntime>>>,
    load_lock: tokio::sync::Mutex<()>,
    anchor_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl PipelineContext {
    pub fn new(config: CairnConfig, effects: PipelineEffects, queue: Arc<DurableQueue>) -> Self {
        Self {
            records: RecordStore::new(effects.durable_store.clone()),
            processor: ChunkProcessor::new(effects.object_store.clone()),
            progress: ProgressHub::new(),
            runtimes: Mutex::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
            anchor_locks: Mutex::new(HashMap::new()),
            config,
            effects,
            queue,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.effects.clock.now_ms()
    }

    pub fn insert_runtime(&self, runtime: SessionRuntime) -> Arc<SessionRuntime> {
        let runtime = Arc::new(runtime);
        self.runtimes
            .lock()
            .insert(runtime.session_id, runtime.clone());
        runtime
    }

    pub fn loaded_runtime(&self, session_id: &SessionId) -> Option<Arc<SessionRuntime>> {
        self.runtimes.lock().get(session_id).cloned()
    }

    /// Runtime for `session_id`, rebuilding it from records on first use
    pub async fn runtime(&self, session_id: &SessionId) -> Result<Arc<SessionRuntime>> {
        if let Some(runtime) = self.loaded_runtime(session_id) {
            return Ok(runtime);
        }
        let _guard = self.load_lock.lock().await;
        if let Some(runtime) = self.loaded_runtime(session_id) {
            return Ok(runtime);
        }
        let session = self.records.require_session(session_id).await?;
        let chunks = self.records.chunks_for(session_id).await?;
        let runtime = SessionRuntime::restore(
            &session,
            &chunks,
            self.effects.keys.as_ref(),
            self.effects.object_store.clone(),
        )
        .await?;
        Ok(self.insert_runtime(runtime))
    }

    pub fn anchor_lock(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        self.anchor_locks
            .lock()
            .entry(*session_id)
            .or_default()
            .clone()
    }

    pub fn forget_session(&self, session_id: &SessionId) {
        self.runtimes.lock().remove(session_id);
        self.anchor_locks.lock().remove(session_id);
        self.progress.remove(session_id);
    }

    pub fn snapshot(&self, session: &SessionRecord) -> SessionProgress {
        SessionProgress {
            status: session.status,
            chunks_captured: session.chunk_count,
            chunks_confirmed: session.anchored_chunk_count,
            queue_depth: self.queue.outstanding_for(&session.session_id),
        }
    }

    /// Recompute and publish the progress snapshot
    pub async fn refresh_progress(&self, session_id: &SessionId) -> Result<()> {
        if let Some(session) = self.records.get_session(session_id).await? {
            self.progress.publish(*session_id, self.snapshot(&session));
        }
        Ok(())
    }

    /// Complete an ended session once nothing is outstanding
    pub async fn settle(&self, session_id: &SessionId) -> Result<()> {
        let Some(session) = self.records.get_session(session_id).await? else {
            return Ok(());
        };
        if session.status == SessionStatus::Uploading
            && self.queue.outstanding_for(session_id) == 0
        {
            let completed = self
                .records
                .update_session(session_id, |s| {
                    if s.status == SessionStatus::Uploading
                        && self.queue.outstanding_for(session_id) == 0
                    {
                        s.status = SessionStatus::Complete;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                })
                .await?;
            if completed {
                let failed = self
                    .queue
                    .terminal_tasks()
                    .iter()
                    .filter(|t| &t.session_id == session_id)
                    .count();
                info!(%session_id, chunks = session.chunk_count, failed, "Session complete");
            }
        }
        self.refresh_progress(session_id).await
    }

    /// Mirror queue outcomes of chunk uploads onto chunk records
    async fn observe(&self, event: &QueueEvent) -> Result<()> {
        let session_id = event.session_id();
        match event {
            QueueEvent::Enqueued {
                kind: TaskKind::UploadChunk { index },
                ..
            } => {
                // Operator retry of a failed upload
                self.records
                    .update_chunk(&session_id, *index, |c| {
                        if c.status == ChunkStatus::Failed {
                            c.advance(ChunkStatus::Pending)
                        } else {
                            Ok(false)
                        }
                    })
                    .await?;
            }
            QueueEvent::Retrying {
                kind: TaskKind::UploadChunk { index },
                attempt,
                error,
                ..
            } => {
                self.records
                    .update_chunk(&session_id, *index, |c| {
                        c.retry_count = *attempt;
                        c.last_error = Some(error.clone());
                        Ok(())
                    })
                    .await?;
            }
            QueueEvent::Failed {
                kind: TaskKind::UploadChunk { index },
                attempt,
                error,
                ..
            } => {
                self.records
                    .update_chunk(&session_id, *index, |c| {
                        c.retry_count = *attempt;
                        c.last_error = Some(error.clone());
                        if c.status.is_uploaded() {
                            Ok(false)
                        } else {
                            c.advance(ChunkStatus::Failed)
                        }
                    })
                    .await?;
            }
            _ => {}
        }
        self.settle(&session_id).await
    }

    /// Bring chunk records in line with the queue and settle every session
    ///
    /// Used when queue events were dropped, so a terminal upload or an
    /// operator retry may not be reflected on its chunk yet.
    pub async fn refresh_all(&self) -> Result<()> {
        for task in self.queue.terminal_tasks() {
            let TaskKind::UploadChunk { index } = task.kind else {
                continue;
            };
            if self.records.get_chunk(&task.session_id, index).await?.is_none() {
                continue;
            }
            self.records
                .update_chunk(&task.session_id, index, |c| {
                    if c.status.is_uploaded() || c.status == ChunkStatus::Failed {
                        return Ok(false);
                    }
                    c.retry_count = task.attempt;
                    c.last_error = task.last_error.clone();
                    c.advance(ChunkStatus::Failed)
                })
                .await?;
        }

        for session in self.records.list_sessions().await? {
            let session_id = session.session_id;
            for chunk in self.records.chunks_for(&session_id).await? {
                let kind = TaskKind::UploadChunk { index: chunk.index };
                if chunk.status == ChunkStatus::Failed
                    && self
                        .queue
                        .any_outstanding(|t| t.session_id == session_id && t.kind == kind)
                {
                    self.records
                        .update_chunk(&session_id, chunk.index, |c| {
                            if c.status == ChunkStatus::Failed {
                                c.advance(ChunkStatus::Pending)
                            } else {
                                Ok(false)
                            }
                        })
                        .await?;
                }
            }
            self.settle(&session_id).await?;
        }
        Ok(())
    }

    /// Record a captured chunk and queue its upload
    ///
    /// The payload is already durable, so a failure here loses nothing: the
    /// chunk is rebuilt from its payload on the next start.
    async fn admit_chunk(
        &self,
        session_id: SessionId,
        index: u32,
        payload_len: u64,
        captured_at: u64,
    ) -> Result<()> {
        self.records
            .put_chunk(&ChunkRecord::captured(
                session_id,
                index,
                payload_len,
                captured_at,
            ))
            .await?;
        self.records
            .update_session(&session_id, |s| {
                s.chunk_count = s.chunk_count.max(index + 1);
                Ok(())
            })
            .await?;
        self.queue
            .enqueue(
                session_id,
                TaskKind::UploadChunk { index },
                Some(payload_key(&session_id, index)),
            )
            .await?;
        debug!(%session_id, index, "Chunk admitted");
        self.refresh_progress(&session_id).await
    }

    /// Admit captured chunks in capture order until every sender is gone
    pub async fn intake(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Intake>) {
        while let Some(item) = rx.recv().await {
            match item {
                Intake::Chunk {
                    session_id,
                    index,
                    payload_len,
                    captured_at,
                } => {
                    if let Err(e) = self
                        .admit_chunk(session_id, index, payload_len, captured_at)
                        .await
                    {
                        error!(%session_id, index, error = %e, "Failed to admit captured chunk");
                    }
                }
                Intake::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Consume queue events until the queue is dropped
    pub async fn listen(self: Arc<Self>, mut events: broadcast::Receiver<QueueEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.observe(&event).await {
                        warn!(session_id = %event.session_id(), error = %e, "Failed to apply queue event");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Queue event listener lagged; refreshing all sessions");
                    if let Err(e) = self.refresh_all().await {
                        warn!(error = %e, "Failed to refresh sessions");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

//! Durable retry queue
//!
//! Every task is written to the durable store before it becomes visible to
//! the drain loop, so a crash between the two leaves it recoverable rather
//! than lost. The drain loop dispatches ready tasks in ascending id order to
//! at most `worker_count` concurrent executions. A failed attempt is
//! rescheduled with backoff while the error is transient and the attempt
//! ceiling has not been reached; otherwise the task is marked terminal and
//! kept (in memory and on disk) until an operator retries or dismisses it.

use crate::config::QueueConfig;
use crate::reliability::RetryPolicy;
use async_trait::async_trait;
use cairn_core::effects::{DurableStore, PhysicalTimeEffects};
use cairn_core::serialization::to_record_bytes;
use cairn_core::{CairnError, QueueTask, Result, SessionId, TaskId, TaskKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Durable-store prefix for queued tasks
pub const QUEUE_PREFIX: &str = "queue/";

const EVENT_CAPACITY: usize = 1024;

fn task_key(id: TaskId) -> String {
    format!("{QUEUE_PREFIX}{:020}", id.0)
}

/// Executes one task attempt
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task's effect; an `Err` counts as a failed attempt
    async fn execute(&self, task: &QueueTask) -> Result<()>;
}

/// Queue lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Persisted and visible to workers
    Enqueued {
        /// Task id
        id: TaskId,
        /// Owning session
        session_id: SessionId,
        /// Work kind
        kind: TaskKind,
    },
    /// Completed and removed
    Succeeded {
        /// Task id
        id: TaskId,
        /// Owning session
        session_id: SessionId,
        /// Work kind
        kind: TaskKind,
    },
    /// Failed an attempt and was rescheduled
    Retrying {
        /// Task id
        id: TaskId,
        /// Owning session
        session_id: SessionId,
        /// Work kind
        kind: TaskKind,
        /// Attempts made so far
        attempt: u32,
        /// Delay until the next attempt
        delay_ms: u64,
        /// Failure message
        error: String,
    },
    /// Gave up; the task is now terminal
    Failed {
        /// Task id
        id: TaskId,
        /// Owning session
        session_id: SessionId,
        /// Work kind
        kind: TaskKind,
        /// Attempts made
        attempt: u32,
        /// Failure message
        error: String,
    },
    /// A terminal task was removed by an operator
    Dismissed {
        /// Task id
        id: TaskId,
        /// Owning session
        session_id: SessionId,
    },
}

impl QueueEvent {
    /// Session the event concerns
    pub fn session_id(&self) -> SessionId {
        match self {
            QueueEvent::Enqueued { session_id, .. }
            | QueueEvent::Succeeded { session_id, .. }
            | QueueEvent::Retrying { session_id, .. }
            | QueueEvent::Failed { session_id, .. }
            | QueueEvent::Dismissed { session_id, .. } => *session_id,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeMap<TaskId, QueueTask>,
    in_flight: BTreeMap<TaskId, QueueTask>,
    terminal: BTreeMap<TaskId, QueueTask>,
}

impl QueueState {
    fn outstanding(&self) -> impl Iterator<Item = &QueueTask> {
        self.pending.values().chain(self.in_flight.values())
    }
}

enum NextTask {
    Ready(QueueTask),
    WaitMs(u64),
    Idle,
}

/// Crash-resilient task queue with bounded concurrency
pub struct DurableQueue {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn PhysicalTimeEffects>,
    policy: RetryPolicy,
    worker_count: usize,
    attempt_timeout: Duration,
    state: Mutex<QueueState>,
    next_seq: AtomicU64,
    notify: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl DurableQueue {
    /// Create an empty queue; call [`DurableQueue::recover`] before enqueueing
    pub fn new(
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn PhysicalTimeEffects>,
        config: &QueueConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            clock,
            policy: RetryPolicy::from_config(config),
            worker_count: config.worker_count.max(1),
            attempt_timeout: config.attempt_timeout(),
            state: Mutex::new(QueueState::default()),
            next_seq: AtomicU64::new(1),
            notify: Notify::new(),
            events,
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Reload persisted tasks; returns how many are runnable
    ///
    /// Undecodable task records mean the store itself is damaged and are
    /// reported as `StoreCorruption` rather than skipped.
    pub async fn recover(&self) -> Result<usize> {
        let entries = self.store.scan(QUEUE_PREFIX).await?;
        let mut runnable = 0;
        let mut max_seq = 0;
        {
            let mut state = self.state.lock();
            for (key, bytes) in entries {
                let task: QueueTask = serde_json::from_slice(&bytes).map_err(|e| {
                    CairnError::store_corruption(format!("Undecodable queue task {key}: {e}"))
                })?;
                max_seq = max_seq.max(task.id.0);
                if state.pending.contains_key(&task.id)
                    || state.in_flight.contains_key(&task.id)
                    || state.terminal.contains_key(&task.id)
                {
                    continue;
                }
                if task.terminal {
                    state.terminal.insert(task.id, task);
                } else {
                    runnable += 1;
                    state.pending.insert(task.id, task);
                }
            }
        }
        self.next_seq.fetch_max(max_seq + 1, Ordering::SeqCst);
        info!(runnable, "Recovered durable queue");
        self.notify.notify_one();
        Ok(runnable)
    }

    /// Persist a task, then make it visible to workers
    pub async fn enqueue(
        &self,
        session_id: SessionId,
        kind: TaskKind,
        payload_ref: Option<String>,
    ) -> Result<TaskId> {
        let id = TaskId(self.next_seq.fetch_add(1, Ordering::SeqCst));
        let task = QueueTask::new(id, session_id, kind.clone(), payload_ref, self.clock.now_ms());
        self.persist(&task).await?;

        self.state.lock().pending.insert(id, task);
        self.notify.notify_one();
        debug!(%id, %session_id, %kind, "Enqueued task");
        self.emit(QueueEvent::Enqueued {
            id,
            session_id,
            kind,
        });
        Ok(id)
    }

    async fn persist(&self, task: &QueueTask) -> Result<()> {
        self.store
            .put(&task_key(task.id), to_record_bytes(task)?)
            .await
    }

    /// Pending plus in-flight tasks
    pub fn depth(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.in_flight.len()
    }

    /// Pending plus in-flight tasks belonging to `session_id`
    pub fn outstanding_for(&self, session_id: &SessionId) -> usize {
        self.state
            .lock()
            .outstanding()
            .filter(|t| &t.session_id == session_id)
            .count()
    }

    /// Whether an outstanding task matches `predicate`
    pub fn any_outstanding<F>(&self, predicate: F) -> bool
    where
        F: Fn(&QueueTask) -> bool,
    {
        self.state.lock().outstanding().any(predicate)
    }

    /// Whether any task, terminal or not, matches `predicate`
    pub fn any_known<F>(&self, predicate: F) -> bool
    where
        F: Fn(&QueueTask) -> bool,
    {
        let state = self.state.lock();
        let found = state.outstanding().chain(state.terminal.values()).any(predicate);
        found
    }

    /// Tasks that exhausted their attempts, in id order
    pub fn terminal_tasks(&self) -> Vec<QueueTask> {
        self.state.lock().terminal.values().cloned().collect()
    }

    /// Give a terminal task a fresh set of attempts
    pub async fn retry_terminal(&self, id: TaskId) -> Result<()> {
        let mut task = self
            .state
            .lock()
            .terminal
            .get(&id)
            .cloned()
            .ok_or_else(|| CairnError::not_found(format!("No terminal task {id}")))?;

        task.terminal = false;
        task.attempt = 0;
        task.last_error = None;
        task.next_attempt_at = self.clock.now_ms();
        self.persist(&task).await?;

        let (session_id, kind) = (task.session_id, task.kind.clone());
        {
            let mut state = self.state.lock();
            state.terminal.remove(&id);
            state.pending.insert(id, task);
        }
        self.notify.notify_one();
        info!(%id, %session_id, %kind, "Requeued terminal task");
        self.emit(QueueEvent::Enqueued {
            id,
            session_id,
            kind,
        });
        Ok(())
    }

    /// Drop a terminal task for good
    pub async fn dismiss_terminal(&self, id: TaskId) -> Result<QueueTask> {
        if !self.state.lock().terminal.contains_key(&id) {
            return Err(CairnError::not_found(format!("No terminal task {id}")));
        }
        self.store.delete(&task_key(id)).await?;
        let task = self
            .state
            .lock()
            .terminal
            .remove(&id)
            .ok_or_else(|| CairnError::not_found(format!("No terminal task {id}")))?;
        info!(%id, session_id = %task.session_id, "Dismissed terminal task");
        self.emit(QueueEvent::Dismissed {
            id,
            session_id: task.session_id,
        });
        Ok(task)
    }

    fn next_task(&self) -> NextTask {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let ready = state
            .pending
            .values()
            .find(|t| t.is_ready(now))
            .map(|t| t.id);
        if let Some(id) = ready {
            if let Some(task) = state.pending.remove(&id) {
                state.in_flight.insert(id, task.clone());
                return NextTask::Ready(task);
            }
        }
        match state.pending.values().map(|t| t.next_attempt_at).min() {
            Some(at) => NextTask::WaitMs(at.saturating_sub(now).max(1)),
            None => NextTask::Idle,
        }
    }

    /// Run tasks until `shutdown` flips; in-flight attempts are dropped with
    /// the loop and will be replayed from the durable store on recovery
    pub async fn drain(
        self: Arc<Self>,
        handler: Arc<dyn TaskHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut running = JoinSet::new();
        debug!(workers = self.worker_count, "Queue drain loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut wait_ms = None;
            if running.len() < self.worker_count {
                match self.next_task() {
                    NextTask::Ready(task) => {
                        running.spawn(self.clone().attempt(handler.clone(), task));
                        continue;
                    }
                    NextTask::WaitMs(ms) => wait_ms = Some(ms),
                    NextTask::Idle => {}
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                Some(_) = running.join_next(), if !running.is_empty() => {}
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(wait_ms.unwrap_or(0))), if wait_ms.is_some() => {}
            }
        }
        debug!(abandoned = running.len(), "Queue drain loop stopped");
    }

    async fn attempt(self: Arc<Self>, handler: Arc<dyn TaskHandler>, task: QueueTask) {
        debug!(id = %task.id, session_id = %task.session_id, kind = %task.kind, attempt = task.attempt + 1, "Executing task");
        let result = match tokio::time::timeout(self.attempt_timeout, handler.execute(&task)).await
        {
            Ok(result) => result,
            Err(_) => Err(CairnError::timeout(
                task.kind.label(),
                self.attempt_timeout.as_millis() as u64,
            )),
        };
        match result {
            Ok(()) => self.complete(task).await,
            Err(err) => self.fail(task, err).await,
        }
        self.notify.notify_one();
    }

    async fn complete(&self, task: QueueTask) {
        if let Err(e) = self.store.delete(&task_key(task.id)).await {
            // The task will replay after a restart; handlers are idempotent
            warn!(id = %task.id, error = %e, "Failed to delete completed task");
        }
        self.state.lock().in_flight.remove(&task.id);
        debug!(id = %task.id, session_id = %task.session_id, kind = %task.kind, "Task succeeded");
        self.emit(QueueEvent::Succeeded {
            id: task.id,
            session_id: task.session_id,
            kind: task.kind,
        });
    }

    async fn fail(&self, mut task: QueueTask, err: CairnError) {
        task.attempt += 1;
        task.last_error = Some(err.to_string());

        if self.policy.should_retry(task.attempt, &err) {
            let delay = self.policy.delay_after(task.attempt);
            let delay_ms = delay.as_millis() as u64;
            task.next_attempt_at = self.clock.now_ms() + delay_ms;
            if let Err(e) = self.persist(&task).await {
                warn!(id = %task.id, error = %e, "Failed to persist retry schedule");
            }
            warn!(
                id = %task.id,
                session_id = %task.session_id,
                kind = %task.kind,
                attempt = task.attempt,
                delay_ms,
                error = %err,
                "Task failed; retrying"
            );
            let event = QueueEvent::Retrying {
                id: task.id,
                session_id: task.session_id,
                kind: task.kind.clone(),
                attempt: task.attempt,
                delay_ms,
                error: err.to_string(),
            };
            {
                let mut state = self.state.lock();
                state.in_flight.remove(&task.id);
                state.pending.insert(task.id, task);
            }
            self.emit(event);
        } else {
            task.terminal = true;
            if let Err(e) = self.persist(&task).await {
                warn!(id = %task.id, error = %e, "Failed to persist terminal task");
            }
            error!(
                id = %task.id,
                session_id = %task.session_id,
                kind = %task.kind,
                attempt = task.attempt,
                error = %err,
                "Task failed terminally"
            );
            let event = QueueEvent::Failed {
                id: task.id,
                session_id: task.session_id,
                kind: task.kind.clone(),
                attempt: task.attempt,
                error: err.to_string(),
            };
            {
                let mut state = self.state.lock();
                state.in_flight.remove(&task.id);
                state.terminal.insert(task.id, task);
            }
            self.emit(event);
        }
    }
}

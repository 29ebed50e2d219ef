//! Per-session progress channels

use cairn_core::{SessionId, SessionProgress};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;

/// Holds one `watch` channel per known session
#[derive(Debug, Default)]
pub struct ProgressHub {
    channels: Mutex<HashMap<SessionId, watch::Sender<SessionProgress>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot for `session_id`, creating the channel if needed
    pub fn publish(&self, session_id: SessionId, progress: SessionProgress) {
        let mut channels = self.channels.lock();
        match channels.get(&session_id) {
            Some(tx) => {
                tx.send_if_modified(|current| {
                    if *current == progress {
                        false
                    } else {
                        *current = progress;
                        true
                    }
                });
            }
            None => {
                let (tx, _rx) = watch::channel(progress);
                channels.insert(session_id, tx);
            }
        }
    }

    /// Subscribe to `session_id`; `None` until a snapshot has been published
    pub fn subscribe(&self, session_id: &SessionId) -> Option<watch::Receiver<SessionProgress>> {
        self.channels.lock().get(session_id).map(watch::Sender::subscribe)
    }

    /// Latest snapshot
    pub fn current(&self, session_id: &SessionId) -> Option<SessionProgress> {
        self.channels.lock().get(session_id).map(|tx| *tx.borrow())
    }

    pub fn remove(&self, session_id: &SessionId) {
        self.channels.lock().remove(session_id);
    }
}

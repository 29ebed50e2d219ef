//! Background loops owned by a coordinator
//!
//! The queue drain loop, the queue event listener and the capture intake run
//! until the coordinator shuts down or is dropped. Each loop is registered
//! under a name so shutdown can report what it stopped.

use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Named background loops sharing one shutdown signal
#[derive(Debug)]
pub struct TaskRegistry {
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl TaskRegistry {
    /// Registry with nothing running
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Run `fut` as the loop called `name` until shutdown
    ///
    /// A loop that returns on its own (its channel closed) is logged and
    /// forgotten.
    pub fn spawn_loop<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = fut => debug!(name, "Background loop exited"),
            }
        });
        let mut loops = self.loops.lock();
        loops.retain(|(_, h)| !h.is_finished());
        loops.push((name, handle));
    }

    /// Receiver that flips to `true` on shutdown, for loops that check it
    /// between steps
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop every loop; returns how many were still running
    pub fn shutdown(&self) -> usize {
        self.shutdown_tx.send_replace(true);
        let mut stopped = 0;
        for (name, handle) in self.loops.lock().drain(..) {
            if !handle.is_finished() {
                debug!(name, "Stopping background loop");
                stopped += 1;
            }
            handle.abort();
        }
        stopped
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_stops_running_loops_only() {
        let registry = TaskRegistry::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        registry.spawn_loop("sleeper", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
        });
        registry.spawn_loop("oneshot", async {});
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut signal = registry.shutdown_signal();
        assert_eq!(registry.shutdown(), 1);
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(registry.shutdown(), 0);
    }
}

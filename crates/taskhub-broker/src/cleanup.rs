//! Background sweep of expired store entries.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskhub_core::error::{DispatchError, Result};
use tokio::task::JoinHandle;

use crate::timed_store::TimedStore;

/// Periodically purges expired entries from a [`TimedStore`].
///
/// Purely advisory: readers already treat expired entries as absent.
pub struct CleanupLoop {
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the sweep on the current tokio runtime. No-op when already running.
    pub fn start<V>(&self, store: Arc<TimedStore<V>>) -> Result<()>
    where
        V: Clone + Send + 'static,
    {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::warn!("Cleanup loop already running");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DispatchError::Runtime(format!("cleanup loop needs a tokio runtime: {e}")))?;
        let period = self.interval;
        *handle = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; skip it so a fresh store
            // is not swept on startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.purge_expired();
                if removed > 0 {
                    tracing::info!("🧹 Cleaned {} expired entries", removed);
                }
            }
        }));
        tracing::info!("🧹 Cleanup loop started (every {:?})", period);
        Ok(())
    }

    /// Abort the sweep. Never waits for an in-flight pass; no-op when stopped.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            tracing::info!("🧹 Cleanup loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CleanupLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

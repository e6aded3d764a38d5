//! Process-wide scheduler instance.

use std::sync::{Arc, Mutex};

use taskhub_broker::init_global_broker;
use taskhub_core::config::TaskHubConfig;
use taskhub_core::error::Result;

use crate::engine::Scheduler;

static GLOBAL_SCHEDULER: Mutex<Option<Arc<Scheduler>>> = Mutex::new(None);

/// Get the global scheduler, creating it on first use from
/// `~/.taskhub/config.toml`. It shares the global broker and is started
/// when a tokio runtime is available.
pub fn global_scheduler() -> Result<Arc<Scheduler>> {
    let mut slot = GLOBAL_SCHEDULER.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(scheduler) = slot.as_ref() {
        return Ok(Arc::clone(scheduler));
    }

    let config = TaskHubConfig::load()?;
    let broker = init_global_broker(&config.broker);
    let scheduler = Arc::new(Scheduler::open(&config.scheduler, broker)?);
    if let Err(e) = scheduler.start() {
        tracing::warn!("⚠️ Global scheduler created without tick loop: {e}");
    }
    *slot = Some(Arc::clone(&scheduler));
    Ok(scheduler)
}

/// Stop and drop the global scheduler. Returns false when none was running.
pub fn shutdown_global_scheduler() -> bool {
    let taken = GLOBAL_SCHEDULER
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    match taken {
        Some(scheduler) => {
            scheduler.stop();
            tracing::info!("⏰ Global scheduler shut down");
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_without_instance() {
        assert!(!shutdown_global_scheduler());
    }
}

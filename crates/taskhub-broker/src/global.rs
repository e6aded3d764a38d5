//! Process-wide broker instance.

use std::sync::{Arc, Mutex};

use taskhub_core::config::BrokerConfig;

use crate::broker::Broker;

static GLOBAL_BROKER: Mutex<Option<Arc<Broker>>> = Mutex::new(None);

/// Get the global broker, creating it on first use.
///
/// The cleanup loop is started when a tokio runtime is available.
pub fn global_broker() -> Arc<Broker> {
    init_global_broker(&BrokerConfig::default())
}

/// Like [`global_broker`], but with explicit settings for the first init.
/// Later calls return the existing instance unchanged.
pub fn init_global_broker(config: &BrokerConfig) -> Arc<Broker> {
    let mut slot = GLOBAL_BROKER.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(broker) = slot.as_ref() {
        return Arc::clone(broker);
    }

    let broker = Arc::new(Broker::new(config));
    if let Err(e) = broker.start_cleanup() {
        tracing::warn!("⚠️ Global broker created without cleanup loop: {e}");
    }
    tracing::info!("📬 Global broker created");
    *slot = Some(Arc::clone(&broker));
    broker
}

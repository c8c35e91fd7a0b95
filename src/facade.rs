//! Process-wide accessor
//!
//! Prefer constructing a [`ConnectionManager`] at the composition root and
//! passing clones around. This module exists for hosts that need one shared
//! instance reachable from anywhere.

use std::sync::{Arc, OnceLock};

use crate::config::PushConfig;
use crate::error::PushError;
use crate::network::event_bus::EventBus;
use crate::network::websocket::WebSocketTransport;
use crate::network::ConnectionManager;

static CONFIG: OnceLock<PushConfig> = OnceLock::new();
static MANAGER: OnceLock<ConnectionManager> = OnceLock::new();

/// Set the configuration used when the shared manager is first built.
/// Returns false if a configuration was already set.
pub fn configure(config: PushConfig) -> bool {
    CONFIG.set(config).is_ok()
}

/// Shared manager, built on first use over the WebSocket transport.
/// Must first be called from inside a Tokio runtime.
pub fn get() -> Result<&'static ConnectionManager, PushError> {
    if let Some(manager) = MANAGER.get() {
        return Ok(manager);
    }
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| PushError::NoRuntime)?;
    let config = CONFIG.get_or_init(PushConfig::default);
    config.validate()?;
    Ok(MANAGER.get_or_init(|| {
        let transport = WebSocketTransport::new().with_connect_timeout(config.connect_timeout());
        ConnectionManager::spawn_on(
            &runtime,
            config,
            Arc::new(transport),
            EventBus::new(config.event_capacity),
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_returns_same_instance() {
        let a = get().unwrap();
        let b = get().unwrap();
        assert!(std::ptr::eq(a, b));
        assert!(!configure(PushConfig::default()));
    }
}

use sandbox_gateway_core::config::GatewaySettings;
use sandbox_gateway_core::relay::SessionRelay;
use sandbox_gateway_core::sandbox::{LifecycleManager, RuntimeDriver};
use std::sync::Arc;

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    /// Sandbox lifecycle operations
    pub manager: Arc<LifecycleManager>,
    /// Session relay hub
    pub relay: Arc<SessionRelay>,
}

impl AppState {
    /// Build the lifecycle manager and relay on top of `driver`
    #[must_use]
    pub fn new(driver: Arc<dyn RuntimeDriver>, settings: GatewaySettings) -> Self {
        Self::from_manager(LifecycleManager::new(driver, settings))
    }

    /// Wrap an existing lifecycle manager
    #[must_use]
    pub fn from_manager(manager: LifecycleManager) -> Self {
        let manager = Arc::new(manager);
        let relay = Arc::new(SessionRelay::new(manager.clone()));
        Self { manager, relay }
    }
}

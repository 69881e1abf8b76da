//! Shared forwarding context
//!
//! The Forwarder holds the process-wide pieces every rule runtime uses: the
//! buffer pool, the control bus, the rule store and runtime tuning. It is
//! built once at startup and injected into each runtime.

use std::sync::Arc;

use super::buffer_pool::BufferPool;
use super::control::ControlBus;
use super::hooks::RuleStore;
use crate::config::RuntimeConfig;
use crate::error::{ForwardError, Result};

/// Shared components for all rule runtimes
pub struct Forwarder {
    /// Relay buffers shared by every TCP pump
    pub pool: Arc<BufferPool>,
    /// Stop signaling keyed by rule
    pub bus: ControlBus,
    /// Storage collaborator for counters and rule state
    pub store: Arc<dyn RuleStore>,
    /// Runtime tuning
    pub config: RuntimeConfig,
}

impl Forwarder {
    pub fn builder() -> ForwarderBuilder {
        ForwarderBuilder::new()
    }
}

/// Builder for constructing a Forwarder
pub struct ForwarderBuilder {
    pool: Option<Arc<BufferPool>>,
    bus: Option<ControlBus>,
    store: Option<Arc<dyn RuleStore>>,
    config: Option<RuntimeConfig>,
}

impl Default for ForwarderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwarderBuilder {
    pub fn new() -> Self {
        Self {
            pool: None,
            bus: None,
            store: None,
            config: None,
        }
    }

    /// Set buffer pool (default: sized from the runtime config)
    pub fn pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set control bus (default: a fresh bus)
    pub fn bus(mut self, bus: ControlBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set rule store
    pub fn store(mut self, store: Arc<dyn RuleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set runtime configuration (default: `RuntimeConfig::default()`)
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the forwarder; a rule store is required
    pub fn build(self) -> Result<Forwarder> {
        let store = self
            .store
            .ok_or_else(|| ForwardError::Config("rule store is required".to_string()))?;
        let config = self.config.unwrap_or_default();
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(BufferPool::new(config.pool_capacity, config.buffer_size)));

        Ok(Forwarder {
            pool,
            bus: self.bus.unwrap_or_default(),
            store,
            config,
        })
    }
}

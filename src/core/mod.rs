//! Forwarding core
//!
//! Per-rule runtimes and the pieces they are built from:
//! - Rule definitions and keys
//! - Buffer pool, session registry and stats loop
//! - TCP session pump and UDP relay
//! - Control bus for stopping rules
//! - Hook traits for the storage collaborator

pub mod buffer_pool;
pub mod control;
mod forwarder;
pub mod hooks;
pub mod pump;
pub mod registry;
pub mod rule;
mod runtime;
pub mod stats;
pub mod udp;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use control::{ControlBus, Subscription};
pub use forwarder::{Forwarder, ForwarderBuilder};
pub use hooks::RuleStore;
pub use registry::{SessionRegistry, TickOutcome, TrafficReport};
pub use rule::{ForwardingRule, Protocol, RuleId, RuleKey, RuleStatus};
pub use runtime::{RuleHandle, RuleRuntime};

//! Multi-rule TCP/UDP port forwarder
//!
//! Architecture:
//! - `core/`: per-rule forwarding runtime, session registry, stop signaling
//! - `business/`: rule stores and the rule manager
//! - `config`: CLI arguments and runtime tuning
//! - `logger`: tracing setup and logging helpers

pub mod business;
pub mod config;
pub mod core;
pub mod error;
pub mod logger;

pub use error::{ForwardError, Result};

//! Business logic implementations
//!
//! This module contains the pieces around the forwarding core:
//! - Rule stores (in-memory and TOML file)
//! - Rule lifecycle management

mod manager;
mod store;

pub use manager::RuleManager;
pub use store::{MemoryStore, TomlStore};

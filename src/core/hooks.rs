//! Hook traits for extensibility
//!
//! Defines the storage collaborator the forwarding core reports to. The core
//! treats every call as best-effort: failures are logged, never retried.

use super::rule::{ForwardingRule, RuleId, RuleStatus};
use crate::error::Result;

/// Rule persistence
///
/// Synchronous: implementations are in-memory maps or small file rewrites,
/// and the stats loop calls them outside the registry lock.
pub trait RuleStore: Send + Sync {
    /// Persist a new rule and return its assigned id
    fn create_rule(&self, rule: &ForwardingRule) -> Result<RuleId>;
    fn get_rule(&self, id: RuleId) -> Result<Option<ForwardingRule>>;
    fn list_rules(&self) -> Result<Vec<ForwardingRule>>;
    /// Returns false if no rule has this id
    fn update_status(&self, id: RuleId, status: RuleStatus) -> Result<bool>;
    fn update_byte_counter(&self, id: RuleId, total_bytes: u64) -> Result<()>;
    fn update_gigabyte_counter(&self, id: RuleId, total_gigabytes: u64) -> Result<()>;
    fn delete_rule(&self, id: RuleId) -> Result<()>;
}

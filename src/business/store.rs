//! Rule store implementations
//!
//! `MemoryStore` keeps rules for the life of the process. `TomlStore` keeps
//! the same data in a TOML file, rewritten whole on every mutation.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::hooks::RuleStore;
use crate::core::rule::{ForwardingRule, RuleId, RuleStatus};
use crate::error::{ForwardError, Result};
use crate::logger::log;

/// In-memory rule store
pub struct MemoryStore {
    rules: DashMap<RuleId, ForwardingRule>,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl RuleStore for MemoryStore {
    fn create_rule(&self, rule: &ForwardingRule) -> Result<RuleId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut stored = rule.clone();
        stored.id = id;
        self.rules.insert(id, stored);
        Ok(id)
    }

    fn get_rule(&self, id: RuleId) -> Result<Option<ForwardingRule>> {
        Ok(self.rules.get(&id).map(|r| r.value().clone()))
    }

    fn list_rules(&self) -> Result<Vec<ForwardingRule>> {
        let mut rules: Vec<ForwardingRule> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    fn update_status(&self, id: RuleId, status: RuleStatus) -> Result<bool> {
        match self.rules.get_mut(&id) {
            Some(mut rule) => {
                rule.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn update_byte_counter(&self, id: RuleId, total_bytes: u64) -> Result<()> {
        if let Some(mut rule) = self.rules.get_mut(&id) {
            rule.total_bytes = total_bytes;
        }
        Ok(())
    }

    fn update_gigabyte_counter(&self, id: RuleId, total_gigabytes: u64) -> Result<()> {
        if let Some(mut rule) = self.rules.get_mut(&id) {
            rule.total_gigabytes = total_gigabytes;
        }
        Ok(())
    }

    fn delete_rule(&self, id: RuleId) -> Result<()> {
        self.rules.remove(&id);
        Ok(())
    }
}

/// On-disk layout: a `[[rules]]` array of tables
#[derive(Debug, Default, Serialize, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<ForwardingRule>,
}

/// TOML file backed rule store
pub struct TomlStore {
    path: PathBuf,
    state: Mutex<RulesFile>,
}

impl TomlStore {
    /// Open `path`, loading existing rules; a missing file starts empty
    ///
    /// Rules written without an id get fresh ones and the file is saved back.
    /// Two rules with the same explicit id are a configuration error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(Self {
                path,
                state: Mutex::new(RulesFile::default()),
            });
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| ForwardError::Store(format!("read {}: {}", path.display(), e)))?;
        let mut file: RulesFile = toml::from_str(&content)?;
        let assigned = assign_missing_ids(&mut file.rules)?;
        log::info!(path = %path.display(), rules = file.rules.len(), "Loaded rules file");

        let store = Self {
            path,
            state: Mutex::new(RulesFile::default()),
        };
        if assigned > 0 {
            log::info!(path = %store.path.display(), assigned = assigned, "Assigned ids to rules without one");
            store.save(&file)?;
        }
        *store.lock() = file;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, RulesFile> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rewrite the whole file through a temporary sibling
    fn save(&self, state: &RulesFile) -> Result<()> {
        let content = toml::to_string_pretty(state)?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| ForwardError::Store(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| ForwardError::Store(format!("replace {}: {}", self.path.display(), e)))?;
        Ok(())
    }

    /// Apply `f` to rule `id` and save; false if no such rule
    fn modify(&self, id: RuleId, f: impl FnOnce(&mut ForwardingRule)) -> Result<bool> {
        let mut state = self.lock();
        match state.rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => f(rule),
            None => return Ok(false),
        }
        self.save(&state)?;
        Ok(true)
    }
}

/// Give every rule with id 0 the next free id; returns how many were assigned
fn assign_missing_ids(rules: &mut [ForwardingRule]) -> Result<usize> {
    let mut seen = HashSet::new();
    for rule in rules.iter().filter(|r| r.id != 0) {
        if !seen.insert(rule.id) {
            return Err(ForwardError::Config(format!("duplicate rule id {}", rule.id)));
        }
    }

    let mut next = rules.iter().map(|r| r.id).max().unwrap_or(0) + 1;
    let mut assigned = 0;
    for rule in rules.iter_mut().filter(|r| r.id == 0) {
        rule.id = next;
        next += 1;
        assigned += 1;
    }
    Ok(assigned)
}

impl RuleStore for TomlStore {
    fn create_rule(&self, rule: &ForwardingRule) -> Result<RuleId> {
        let mut state = self.lock();
        let id = state.rules.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let mut stored = rule.clone();
        stored.id = id;
        state.rules.push(stored);
        if let Err(e) = self.save(&state) {
            state.rules.pop();
            return Err(e);
        }
        Ok(id)
    }

    fn get_rule(&self, id: RuleId) -> Result<Option<ForwardingRule>> {
        Ok(self.lock().rules.iter().find(|r| r.id == id).cloned())
    }

    fn list_rules(&self) -> Result<Vec<ForwardingRule>> {
        let mut rules = self.lock().rules.clone();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    fn update_status(&self, id: RuleId, status: RuleStatus) -> Result<bool> {
        self.modify(id, |rule| rule.status = status)
    }

    fn update_byte_counter(&self, id: RuleId, total_bytes: u64) -> Result<()> {
        self.modify(id, |rule| rule.total_bytes = total_bytes)
            .map(|_| ())
    }

    fn update_gigabyte_counter(&self, id: RuleId, total_gigabytes: u64) -> Result<()> {
        self.modify(id, |rule| rule.total_gigabytes = total_gigabytes)
            .map(|_| ())
    }

    fn delete_rule(&self, id: RuleId) -> Result<()> {
        let mut state = self.lock();
        let before = state.rules.len();
        state.rules.retain(|r| r.id != id);
        if state.rules.len() != before {
            self.save(&state)?;
        }
        Ok(())
    }
}

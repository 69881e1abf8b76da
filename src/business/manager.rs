//! Rule lifecycle management
//!
//! Ties the rule store to the forwarding core: starting and stopping
//! runtimes, and keeping the persisted status in step with what runs.

use dashmap::DashMap;
use std::sync::Arc;

use crate::core::rule::{ForwardingRule, Protocol, RuleId, RuleKey, RuleStatus};
use crate::core::{Forwarder, RuleHandle, RuleRuntime};
use crate::logger::log;

pub struct RuleManager {
    forwarder: Arc<Forwarder>,
    /// Handles of started runtimes, awaited on stop and shutdown
    runtimes: DashMap<RuleKey, RuleHandle>,
}

impl RuleManager {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self {
            forwarder,
            runtimes: DashMap::new(),
        }
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    fn is_reserved(&self, rule: &ForwardingRule) -> bool {
        rule.protocol == Protocol::Tcp && self.forwarder.config.admin_port == Some(rule.local_port)
    }

    /// Whether a runtime currently owns the rule's key
    pub fn is_running(&self, rule: &ForwardingRule) -> bool {
        self.forwarder.bus.is_active(&rule.key())
    }

    /// Bind and start a runtime for `rule`
    ///
    /// Returns false if the key is reserved, already active, or the bind fails.
    pub async fn start_rule(&self, rule: &ForwardingRule) -> bool {
        match RuleRuntime::start(Arc::clone(&self.forwarder), rule.clone()).await {
            Ok(handle) => {
                self.runtimes.insert(handle.key().clone(), handle);
                true
            }
            Err(e) => {
                log::warn!(rule = %rule.key(), id = rule.id, error = %e, "Failed to start rule");
                false
            }
        }
    }

    /// Stop the runtime serving `rule` and wait for its teardown
    ///
    /// Returns false if no runtime owned the key, or if the key is served by
    /// a runtime started for a different rule id. That runtime is left alone.
    pub async fn stop_rule(&self, rule: &ForwardingRule) -> bool {
        let key = rule.key();
        let owner = self.runtimes.get(&key).map(|handle| handle.rule_id());
        if let Some(owner) = owner.filter(|owner| *owner != rule.id) {
            log::debug!(rule = %key, id = rule.id, owner = owner, "Key served by another rule, not stopping");
            return false;
        }

        let stopped = self.forwarder.bus.publish_stop(&key);
        if stopped {
            log::rule(&key.to_string(), "stop requested");
        }
        if let Some((_, handle)) = self
            .runtimes
            .remove_if(&key, |_, handle| handle.rule_id() == rule.id)
        {
            handle.join().await;
        }
        stopped
    }

    /// Persist a new rule and start it if it is marked running
    ///
    /// A rule that fails to start is deleted again.
    pub async fn add_rule(&self, mut rule: ForwardingRule) -> bool {
        if self.is_reserved(&rule) {
            log::warn!(port = rule.local_port, "Refusing rule on reserved administration port");
            return false;
        }

        rule.id = match self.forwarder.store.create_rule(&rule) {
            Ok(id) => id,
            Err(e) => {
                log::warn!(rule = %rule.key(), error = %e, "Failed to create rule");
                return false;
            }
        };

        if rule.status == RuleStatus::Running && !self.start_rule(&rule).await {
            if let Err(e) = self.forwarder.store.delete_rule(rule.id) {
                log::warn!(id = rule.id, error = %e, "Failed to delete unstartable rule");
            }
            return false;
        }

        log::info!(rule = %rule.key(), id = rule.id, upstream = %rule.upstream(), "Rule added");
        true
    }

    /// Delete a rule from the store and stop it
    pub async fn delete_rule(&self, id: RuleId) -> bool {
        let rule = match self.forwarder.store.get_rule(id) {
            Ok(Some(rule)) => rule,
            Ok(None) => return false,
            Err(e) => {
                log::warn!(id = id, error = %e, "Failed to load rule");
                return false;
            }
        };

        if let Err(e) = self.forwarder.store.delete_rule(id) {
            log::warn!(id = id, error = %e, "Failed to delete rule");
            return false;
        }
        self.stop_rule(&rule).await;
        log::rule(&rule.key().to_string(), "deleted");
        true
    }

    /// Change a rule's status, then start or stop it to match
    ///
    /// Refuses to enable a rule whose key is held by another running rule.
    pub async fn set_status(&self, id: RuleId, status: RuleStatus) -> bool {
        let rules = match self.forwarder.store.list_rules() {
            Ok(rules) => rules,
            Err(e) => {
                log::warn!(id = id, error = %e, "Failed to load rules");
                return false;
            }
        };
        let Some(rule) = rules.iter().find(|r| r.id == id).cloned() else {
            return false;
        };

        if status == RuleStatus::Running {
            let key = rule.key();
            let conflict = rules
                .iter()
                .any(|r| r.id != id && r.status == RuleStatus::Running && r.key() == key);
            if conflict {
                log::warn!(rule = %key, id = id, "Rule key held by another running rule");
                return false;
            }
        }

        match self.forwarder.store.update_status(id, status) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                log::warn!(id = id, error = %e, "Failed to update rule status");
                return false;
            }
        }

        match status {
            RuleStatus::Running => {
                if self.is_running(&rule) {
                    return true;
                }
                // Counters may have moved since the rule last ran
                let current = self.forwarder.store.get_rule(id).ok().flatten().unwrap_or(rule);
                if self.start_rule(&current).await {
                    return true;
                }
                if let Err(e) = self.forwarder.store.update_status(id, RuleStatus::Stopped) {
                    log::warn!(id = id, error = %e, "Failed to revert rule status");
                }
                false
            }
            RuleStatus::Stopped => {
                self.stop_rule(&rule).await;
                true
            }
        }
    }

    /// Start every persisted rule marked running; returns how many started
    pub async fn restore(&self) -> usize {
        let rules = match self.forwarder.store.list_rules() {
            Ok(rules) => rules,
            Err(e) => {
                log::error!(error = %e, "Failed to load rules");
                return 0;
            }
        };

        let mut started = 0;
        for rule in rules.iter().filter(|r| r.status == RuleStatus::Running) {
            if self.start_rule(rule).await {
                started += 1;
            }
        }
        log::info!(total = rules.len(), started = started, "Rules restored");
        started
    }

    /// Stop every rule and wait for all of them to tear down
    pub async fn shutdown(&self) {
        self.forwarder.bus.shutdown();
        let keys: Vec<RuleKey> = self.runtimes.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.runtimes.remove(&key) {
                handle.join().await;
            }
        }
        log::info!("All rules stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business::MemoryStore;
    use crate::config::RuntimeConfig;
    use std::net::{IpAddr, Ipv4Addr};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn manager(admin_port: Option<u16>) -> RuleManager {
        let config = RuntimeConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            admin_port,
            ..RuntimeConfig::default()
        };
        let forwarder = Forwarder::builder()
            .store(Arc::new(MemoryStore::new()))
            .config(config)
            .build()
            .unwrap();
        RuleManager::new(Arc::new(forwarder))
    }

    fn tcp_rule(port: u16) -> ForwardingRule {
        ForwardingRule::new(port, Protocol::Tcp, "127.0.0.1", 9)
    }

    #[tokio::test]
    async fn test_add_rule_starts_and_persists() {
        let manager = manager(None);
        let rule = tcp_rule(free_port());

        assert!(manager.add_rule(rule.clone()).await);
        assert!(manager.is_running(&rule));
        assert_eq!(manager.forwarder().store.list_rules().unwrap().len(), 1);

        manager.shutdown().await;
        assert!(!manager.is_running(&rule));
    }

    #[tokio::test]
    async fn test_add_rule_rejects_admin_port() {
        let port = free_port();
        let manager = manager(Some(port));

        assert!(!manager.add_rule(tcp_rule(port)).await);
        assert!(manager.forwarder().store.list_rules().unwrap().is_empty());

        // The reservation is TCP only
        let udp = ForwardingRule::new(port, Protocol::Udp, "127.0.0.1", 9);
        assert!(manager.add_rule(udp).await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_rule_that_fails_to_start_is_removed() {
        let manager = manager(None);
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        assert!(!manager.add_rule(tcp_rule(port)).await);
        assert!(manager.forwarder().store.list_rules().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_stopped_rule_does_not_start() {
        let manager = manager(None);
        let mut rule = tcp_rule(free_port());
        rule.status = RuleStatus::Stopped;

        assert!(manager.add_rule(rule.clone()).await);
        assert!(!manager.is_running(&rule));
    }

    #[tokio::test]
    async fn test_duplicate_start_fails() {
        let manager = manager(None);
        let rule = tcp_rule(free_port());

        assert!(manager.start_rule(&rule).await);
        assert!(!manager.start_rule(&rule).await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_rule_unknown_key() {
        let manager = manager(None);
        assert!(!manager.stop_rule(&tcp_rule(free_port())).await);
    }

    #[tokio::test]
    async fn test_stop_then_restart_same_port() {
        let manager = manager(None);
        let rule = tcp_rule(free_port());

        assert!(manager.start_rule(&rule).await);
        assert!(manager.stop_rule(&rule).await);
        assert!(manager.start_rule(&rule).await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_rule_stops_runtime() {
        let manager = manager(None);
        let rule = tcp_rule(free_port());
        assert!(manager.add_rule(rule.clone()).await);
        let id = manager.forwarder().store.list_rules().unwrap()[0].id;

        assert!(manager.delete_rule(id).await);
        assert!(!manager.is_running(&rule));
        assert!(manager.forwarder().store.get_rule(id).unwrap().is_none());
        assert!(!manager.delete_rule(id).await);
    }

    #[tokio::test]
    async fn test_set_status_toggles_runtime() {
        let manager = manager(None);
        let rule = tcp_rule(free_port());
        assert!(manager.add_rule(rule.clone()).await);
        let id = manager.forwarder().store.list_rules().unwrap()[0].id;

        assert!(manager.set_status(id, RuleStatus::Stopped).await);
        assert!(!manager.is_running(&rule));
        assert_eq!(
            manager.forwarder().store.get_rule(id).unwrap().unwrap().status,
            RuleStatus::Stopped
        );

        assert!(manager.set_status(id, RuleStatus::Running).await);
        assert!(manager.is_running(&rule));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_status_refuses_key_conflict() {
        let manager = manager(None);
        let port = free_port();
        assert!(manager.add_rule(tcp_rule(port)).await);

        let mut twin = tcp_rule(port);
        twin.status = RuleStatus::Stopped;
        assert!(manager.add_rule(twin).await);
        let twin_id = manager.forwarder().store.list_rules().unwrap()[1].id;

        assert!(!manager.set_status(twin_id, RuleStatus::Running).await);
        assert_eq!(
            manager
                .forwarder()
                .store
                .get_rule(twin_id)
                .unwrap()
                .unwrap()
                .status,
            RuleStatus::Stopped
        );
        manager.shutdown().await;
    }

    /// Rule A running plus a stopped twin B on the same key; returns (A, B)
    async fn running_rule_with_stopped_twin(manager: &RuleManager) -> (ForwardingRule, ForwardingRule) {
        let port = free_port();
        assert!(manager.add_rule(tcp_rule(port)).await);
        let mut twin = tcp_rule(port);
        twin.status = RuleStatus::Stopped;
        assert!(manager.add_rule(twin).await);

        let rules = manager.forwarder().store.list_rules().unwrap();
        assert_ne!(rules[0].id, rules[1].id);
        (rules[0].clone(), rules[1].clone())
    }

    #[tokio::test]
    async fn test_stopping_twin_keeps_owner_running() {
        let manager = manager(None);
        let (owner, twin) = running_rule_with_stopped_twin(&manager).await;

        assert!(manager.set_status(twin.id, RuleStatus::Stopped).await);
        assert!(manager.is_running(&owner));
        assert!(!manager.stop_rule(&twin).await);
        assert!(manager.is_running(&owner));

        let store = &manager.forwarder().store;
        assert_eq!(store.get_rule(owner.id).unwrap().unwrap().status, RuleStatus::Running);

        // The owner itself still stops normally
        assert!(manager.set_status(owner.id, RuleStatus::Stopped).await);
        assert!(!manager.is_running(&owner));
    }

    #[tokio::test]
    async fn test_deleting_twin_keeps_owner_running() {
        let manager = manager(None);
        let (owner, twin) = running_rule_with_stopped_twin(&manager).await;

        assert!(manager.delete_rule(twin.id).await);
        assert!(manager.forwarder().store.get_rule(twin.id).unwrap().is_none());
        assert!(manager.is_running(&owner));

        // The runtime still accepts connections
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], owner.local_port));
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_status_unknown_rule() {
        let manager = manager(None);
        assert!(!manager.set_status(77, RuleStatus::Running).await);
    }

    #[tokio::test]
    async fn test_restore_starts_running_rules() {
        let manager = manager(None);
        let store = Arc::clone(&manager.forwarder().store);
        let running = tcp_rule(free_port());
        let mut stopped = tcp_rule(free_port());
        stopped.status = RuleStatus::Stopped;
        store.create_rule(&running).unwrap();
        store.create_rule(&stopped).unwrap();

        assert_eq!(manager.restore().await, 1);
        assert!(manager.is_running(&running));
        assert!(!manager.is_running(&stopped));
        manager.shutdown().await;
    }
}

//! Rule stop signaling
//!
//! Keyed registry from rule key to the cancellation token of the runtime
//! that owns it. Stopping a rule is an exact lookup; runtimes of other rules
//! never see the request.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::rule::RuleKey;

#[derive(Debug)]
struct Owner {
    id: u64,
    token: CancellationToken,
}

/// Claim on a rule key held by one runtime
#[derive(Debug, Clone)]
pub struct Subscription {
    key: RuleKey,
    id: u64,
    token: CancellationToken,
}

impl Subscription {
    pub fn key(&self) -> &RuleKey {
        &self.key
    }

    /// Cancelled when the rule is stopped or the bus shuts down
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Process-wide stop channel, cheap to clone
#[derive(Debug, Clone)]
pub struct ControlBus {
    next_id: Arc<AtomicU64>,
    owners: Arc<DashMap<RuleKey, Owner>>,
    root: CancellationToken,
}

impl Default for ControlBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBus {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            owners: Arc::new(DashMap::new()),
            root: CancellationToken::new(),
        }
    }

    /// Claim `key` for a new runtime
    ///
    /// Returns `None` if another runtime already owns the key or the bus has
    /// been shut down.
    pub fn subscribe(&self, key: RuleKey) -> Option<Subscription> {
        if self.root.is_cancelled() {
            return None;
        }
        match self.owners.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let token = self.root.child_token();
                slot.insert(Owner {
                    id,
                    token: token.clone(),
                });
                Some(Subscription { key, id, token })
            }
        }
    }

    /// Request the runtime owning `key` to stop
    ///
    /// Returns false if no runtime owns the key.
    pub fn publish_stop(&self, key: &RuleKey) -> bool {
        match self.owners.remove(key) {
            Some((_, owner)) => {
                owner.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a subscription's claim on its key
    ///
    /// Only removes the entry if it still belongs to this subscription, so a
    /// late release never evicts a newer owner of the same key.
    pub fn release(&self, subscription: &Subscription) {
        self.owners
            .remove_if(&subscription.key, |_, owner| owner.id == subscription.id);
    }

    pub fn is_active(&self, key: &RuleKey) -> bool {
        self.owners.contains_key(key)
    }

    pub fn active_keys(&self) -> Vec<RuleKey> {
        self.owners.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.owners.len()
    }

    /// Stop every rule and refuse new subscriptions
    pub fn shutdown(&self) {
        self.root.cancel();
        self.owners.clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

//! Per-rule session registry and traffic counters
//!
//! One mutex guards the directional session map together with the rule's
//! byte and gigabyte counters, so a stats tick never observes a half-applied
//! pump update and eviction never overlaps an insert.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use super::rule::ForwardingRule;

/// One gigabyte rollover unit (1 GiB)
pub const GIGABYTE: u64 = 1_073_741_824;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

/// Current unix time in whole seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Human-readable throughput: KB below half a MiB, MB otherwise
pub fn format_throughput(total_bytes: u64) -> String {
    let bytes = total_bytes as f64;
    if total_bytes > 0 && bytes / MIB < 0.5 {
        format!("{:.2}KB", bytes / KIB)
    } else {
        format!("{:.2}MB", bytes / MIB)
    }
}

/// The two directional keys of one TCP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLink {
    /// `src->dst`
    pub forward: String,
    /// `dst->src`
    pub reverse: String,
}

impl SessionLink {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            forward: format!("{}->{}", src, dst),
            reverse: format!("{}->{}", dst, src),
        }
    }

    /// Same session seen from the opposite direction
    pub fn reversed(&self) -> Self {
        Self {
            forward: self.reverse.clone(),
            reverse: self.forward.clone(),
        }
    }
}

#[derive(Debug)]
struct SessionRecord {
    last_active: u64,
    handle: CancellationToken,
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<String, SessionRecord>,
    total_bytes: u64,
    total_gigabytes: u64,
    /// `total_bytes` as of the previous stats tick
    last_total: u64,
    closed: bool,
}

/// Throughput report produced by a tick that saw new traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficReport {
    pub total_bytes: u64,
    pub total_gigabytes: u64,
    /// Gigabyte units rolled over during this tick
    pub rollovers: u64,
    pub throughput: String,
    /// Active session keys, sorted
    pub sessions: Vec<String>,
}

/// Result of one stats tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Traffic(TrafficReport),
    /// No new traffic; lists the sessions evicted as idle
    Idle { evicted: Vec<String> },
}

/// Session map plus counters for one rule
#[derive(Debug)]
pub struct SessionRegistry {
    out_time_secs: u64,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(out_time_secs: u64, total_bytes: u64, total_gigabytes: u64) -> Self {
        Self {
            out_time_secs,
            state: Mutex::new(RegistryState {
                total_bytes,
                total_gigabytes,
                last_total: total_bytes,
                ..RegistryState::default()
            }),
        }
    }

    /// Registry seeded with the rule's persisted counters
    pub fn for_rule(rule: &ForwardingRule) -> Self {
        Self::new(rule.out_time_secs, rule.total_bytes, rule.total_gigabytes)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a successful read of `bytes` on the `key` direction
    ///
    /// Upserts the record with `now` and adds to the byte counter. Returns
    /// false, recording nothing, once the registry is closed or the session
    /// has already been force-closed.
    pub fn record_read(&self, key: &str, handle: &CancellationToken, bytes: u64, now: u64) -> bool {
        let mut state = self.lock();
        if state.closed || handle.is_cancelled() {
            return false;
        }
        match state.sessions.get_mut(key) {
            Some(record) => {
                record.last_active = now;
                record.handle = handle.clone();
            }
            None => {
                state.sessions.insert(
                    key.to_string(),
                    SessionRecord {
                        last_active: now,
                        handle: handle.clone(),
                    },
                );
            }
        }
        state.total_bytes = state.total_bytes.saturating_add(bytes);
        true
    }

    /// Add to the byte counter without a session record (UDP)
    pub fn add_bytes(&self, bytes: u64) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.total_bytes = state.total_bytes.saturating_add(bytes);
        true
    }

    /// Force-close a session and delete both directional records
    ///
    /// Absent keys are ignored, so concurrent failure of both directions
    /// deletes each record once. Returns the number of records removed.
    pub fn close_session(&self, link: &SessionLink, handle: &CancellationToken) -> usize {
        let mut state = self.lock();
        handle.cancel();
        Self::remove_link(&mut state, link)
    }

    /// Delete both directional records without touching the handle
    pub fn remove_session(&self, link: &SessionLink) -> usize {
        let mut state = self.lock();
        Self::remove_link(&mut state, link)
    }

    fn remove_link(state: &mut RegistryState, link: &SessionLink) -> usize {
        let mut removed = 0;
        if state.sessions.remove(&link.forward).is_some() {
            removed += 1;
        }
        if state.sessions.remove(&link.reverse).is_some() {
            removed += 1;
        }
        removed
    }

    /// Force-close every session, clear the map and reject further inserts
    ///
    /// Idempotent. Returns the number of records cleared.
    pub fn close_all(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let cleared = state.sessions.len();
        for (_, record) in state.sessions.drain() {
            record.handle.cancel();
        }
        cleared
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Sorted session keys
    pub fn session_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().sessions.contains_key(key)
    }

    /// `(total_bytes, total_gigabytes)`
    pub fn totals(&self) -> (u64, u64) {
        let state = self.lock();
        (state.total_bytes, state.total_gigabytes)
    }

    /// One stats tick at unix time `now`
    ///
    /// With new traffic since the last tick, rolls whole gigabytes out of the
    /// byte counter and reports. Without it, evicts sessions idle longer than
    /// the rule's threshold.
    pub fn tick(&self, now: u64) -> TickOutcome {
        let mut state = self.lock();

        if state.total_bytes > state.last_total {
            let throughput = format_throughput(state.total_bytes);

            let mut rollovers = 0;
            while state.total_bytes >= GIGABYTE {
                state.total_bytes -= GIGABYTE;
                state.total_gigabytes += 1;
                rollovers += 1;
            }
            state.last_total = state.total_bytes;

            let mut sessions: Vec<String> = state.sessions.keys().cloned().collect();
            sessions.sort();

            return TickOutcome::Traffic(TrafficReport {
                total_bytes: state.total_bytes,
                total_gigabytes: state.total_gigabytes,
                rollovers,
                throughput,
                sessions,
            });
        }

        let mut evicted = Vec::new();
        if self.out_time_secs > 1 {
            let out_time = self.out_time_secs;
            state.sessions.retain(|key, record| {
                if now.saturating_sub(record.last_active) > out_time {
                    record.handle.cancel();
                    evicted.push(key.clone());
                    false
                } else {
                    true
                }
            });
            evicted.sort();
        }
        TickOutcome::Idle { evicted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> SessionLink {
        SessionLink::new(
            "10.0.0.2:50000".parse().unwrap(),
            "10.0.0.9:80".parse().unwrap(),
        )
    }

    #[test]
    fn test_session_link_keys() {
        let link = link();
        assert_eq!(link.forward, "10.0.0.2:50000->10.0.0.9:80");
        assert_eq!(link.reverse, "10.0.0.9:80->10.0.0.2:50000");
        assert_eq!(link.reversed().forward, link.reverse);
    }

    #[test]
    fn test_record_read_upserts_and_counts() {
        let registry = SessionRegistry::new(10, 0, 0);
        let handle = CancellationToken::new();
        let link = link();

        assert!(registry.record_read(&link.forward, &handle, 100, 1000));
        assert!(registry.record_read(&link.forward, &handle, 50, 1001));
        assert!(registry.record_read(&link.reverse, &handle, 25, 1002));

        assert_eq!(registry.session_count(), 2);
        assert_eq!(registry.totals(), (175, 0));
    }

    #[test]
    fn test_close_session_removes_both_directions_once() {
        let registry = SessionRegistry::new(10, 0, 0);
        let handle = CancellationToken::new();
        let link = link();
        registry.record_read(&link.forward, &handle, 1, 1);
        registry.record_read(&link.reverse, &handle, 1, 1);

        assert_eq!(registry.close_session(&link, &handle), 2);
        assert!(handle.is_cancelled());
        assert_eq!(registry.session_count(), 0);

        // The opposite direction failing afterwards is a no-op
        assert_eq!(registry.close_session(&link.reversed(), &handle), 0);
    }

    #[test]
    fn test_record_read_rejected_after_force_close() {
        let registry = SessionRegistry::new(10, 0, 0);
        let handle = CancellationToken::new();
        let link = link();
        registry.close_session(&link, &handle);

        assert!(!registry.record_read(&link.forward, &handle, 10, 5));
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.totals(), (0, 0));
    }

    #[test]
    fn test_close_all_clears_and_rejects_inserts() {
        let registry = SessionRegistry::new(10, 0, 0);
        let h1 = CancellationToken::new();
        let h2 = CancellationToken::new();
        registry.record_read("a->b", &h1, 1, 1);
        registry.record_read("c->d", &h2, 1, 1);

        assert_eq!(registry.close_all(), 2);
        assert!(h1.is_cancelled());
        assert!(h2.is_cancelled());
        assert!(registry.is_closed());
        assert_eq!(registry.session_count(), 0);

        let h3 = CancellationToken::new();
        assert!(!registry.record_read("e->f", &h3, 1, 1));
        assert!(!registry.add_bytes(10));
        assert_eq!(registry.close_all(), 0);
    }

    #[test]
    fn test_tick_single_rollover() {
        let registry = SessionRegistry::new(10, 0, 0);
        registry.add_bytes(GIGABYTE + 500);

        match registry.tick(0) {
            TickOutcome::Traffic(report) => {
                assert_eq!(report.total_gigabytes, 1);
                assert_eq!(report.total_bytes, 500);
                assert_eq!(report.rollovers, 1);
            }
            other => panic!("expected traffic report, got {:?}", other),
        }
        assert_eq!(registry.totals(), (500, 1));
    }

    #[test]
    fn test_tick_rolls_over_multiple_gigabytes() {
        let registry = SessionRegistry::new(10, 0, 4);
        registry.add_bytes(2 * GIGABYTE + 7);

        match registry.tick(0) {
            TickOutcome::Traffic(report) => {
                assert_eq!(report.rollovers, 2);
                assert_eq!(report.total_gigabytes, 6);
                assert_eq!(report.total_bytes, 7);
            }
            other => panic!("expected traffic report, got {:?}", other),
        }
    }

    #[test]
    fn test_tick_exact_gigabyte_rolls_to_zero() {
        let registry = SessionRegistry::new(10, 0, 0);
        registry.add_bytes(GIGABYTE);
        registry.tick(0);
        assert_eq!(registry.totals(), (0, 1));
    }

    #[test]
    fn test_tick_without_growth_is_idle() {
        let registry = SessionRegistry::new(10, 4096, 0);
        assert_eq!(registry.tick(0), TickOutcome::Idle { evicted: vec![] });

        registry.add_bytes(1);
        assert!(matches!(registry.tick(0), TickOutcome::Traffic(_)));
        assert!(matches!(registry.tick(0), TickOutcome::Idle { .. }));
    }

    #[test]
    fn test_tick_lists_sessions() {
        let registry = SessionRegistry::new(10, 0, 0);
        let handle = CancellationToken::new();
        registry.record_read("b->a", &handle, 10, 1);
        registry.record_read("a->b", &handle, 10, 1);

        match registry.tick(2) {
            TickOutcome::Traffic(report) => {
                assert_eq!(report.sessions, vec!["a->b".to_string(), "b->a".to_string()]);
                assert_eq!(report.throughput, "0.02KB");
            }
            other => panic!("expected traffic report, got {:?}", other),
        }
    }

    #[test]
    fn test_eviction_boundary() {
        let out_time = 30;
        let registry = SessionRegistry::new(out_time, 0, 0);
        let stale = CancellationToken::new();
        let edge = CancellationToken::new();
        let fresh = CancellationToken::new();
        let now = 10_000;

        registry.record_read("stale", &stale, 1, now - out_time - 1);
        registry.record_read("edge", &edge, 1, now - out_time);
        registry.record_read("fresh", &fresh, 1, now - (out_time - 1));
        // Consume the growth so the next tick evaluates idleness
        registry.tick(now);

        assert_eq!(
            registry.tick(now),
            TickOutcome::Idle {
                evicted: vec!["stale".to_string()]
            }
        );
        assert!(stale.is_cancelled());
        assert!(!edge.is_cancelled());
        assert!(!fresh.is_cancelled());
        assert_eq!(registry.session_keys(), vec!["edge".to_string(), "fresh".to_string()]);
    }

    #[test]
    fn test_eviction_disabled_for_small_threshold() {
        for out_time in [0, 1] {
            let registry = SessionRegistry::new(out_time, 0, 0);
            let handle = CancellationToken::new();
            registry.record_read("old", &handle, 1, 0);
            registry.tick(1_000_000);

            assert_eq!(
                registry.tick(1_000_000),
                TickOutcome::Idle { evicted: vec![] }
            );
            assert!(!handle.is_cancelled());
            assert_eq!(registry.session_count(), 1);
        }
    }

    #[test]
    fn test_format_throughput_units() {
        assert_eq!(format_throughput(1024), "1.00KB");
        assert_eq!(format_throughput(512 * 1024 - 1), "512.00KB");
        assert_eq!(format_throughput(512 * 1024), "0.50MB");
        assert_eq!(format_throughput(3 * 1024 * 1024), "3.00MB");
        assert_eq!(format_throughput(0), "0.00MB");
    }

    #[test]
    fn test_for_rule_seeds_counters() {
        use crate::core::rule::Protocol;

        let mut rule = ForwardingRule::new(1, Protocol::Tcp, "127.0.0.1", 2);
        rule.total_bytes = 900;
        rule.total_gigabytes = 2;
        let registry = SessionRegistry::for_rule(&rule);

        assert_eq!(registry.totals(), (900, 2));
        // Persisted bytes are the baseline, not new traffic
        assert!(matches!(registry.tick(0), TickOutcome::Idle { .. }));
    }

    #[test]
    fn test_concurrent_counting() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(SessionRegistry::new(10, 0, 0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let r = Arc::clone(&registry);
                thread::spawn(move || {
                    let handle = CancellationToken::new();
                    let key = format!("peer{}->up", i);
                    for t in 0..1000 {
                        r.record_read(&key, &handle, 3, t);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.totals(), (24_000, 0));
        assert_eq!(registry.session_count(), 8);
    }
}

//! Per-rule stats and eviction loop
//!
//! Every tick either reports new traffic (and persists the counters) or, on a
//! quiet tick, sweeps idle sessions. Store failures are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::hooks::RuleStore;
use super::registry::{unix_now, SessionRegistry, TickOutcome, TrafficReport};
use super::rule::RuleId;
use crate::logger::log;

pub struct StatsLoop {
    pub rule_id: RuleId,
    /// Rule key, for logs
    pub rule: String,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn RuleStore>,
    pub interval: Duration,
}

impl StatsLoop {
    /// Run one tick at unix time `now`
    pub fn tick_once(&self, now: u64) -> TickOutcome {
        let outcome = self.registry.tick(now);
        match &outcome {
            TickOutcome::Traffic(report) => {
                log::info!(
                    rule = %self.rule,
                    throughput = %report.throughput,
                    total_gigabytes = report.total_gigabytes,
                    sessions = report.sessions.len(),
                    "Traffic"
                );
                log::debug!(rule = %self.rule, sessions = ?report.sessions, "Active sessions");
                self.persist(report);
            }
            TickOutcome::Idle { evicted } => {
                for key in evicted {
                    log::session(&self.rule, key, "evicted");
                }
            }
        }
        outcome
    }

    fn persist(&self, report: &TrafficReport) {
        if let Err(e) = self
            .store
            .update_byte_counter(self.rule_id, report.total_bytes)
        {
            log::warn!(rule = %self.rule, error = %e, "Failed to persist byte counter");
        }
        if report.rollovers > 0 {
            if let Err(e) = self
                .store
                .update_gigabyte_counter(self.rule_id, report.total_gigabytes)
            {
                log::warn!(rule = %self.rule, error = %e, "Failed to persist gigabyte counter");
            }
        }
    }

    /// Tick on the configured interval until `token` is cancelled
    ///
    /// The first tick fires one full interval after start.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    log::debug!(rule = %self.rule, "Stats loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.tick_once(unix_now());
                }
            }
        }
    }
}

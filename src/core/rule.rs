//! Forwarding rule definition
//!
//! A rule binds one local port to one remote endpoint. The rule key
//! (local port + protocol) identifies it among active rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rule identifier assigned by the store
pub type RuleId = u64;

/// Transport protocol of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// Parse a protocol name, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired run state of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Running,
    Stopped,
}

/// Identity of a rule among active rules: local port + protocol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub port: u16,
    pub protocol: Protocol,
}

impl RuleKey {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.port, self.protocol)
    }
}

/// One configured forwarding path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    #[serde(default)]
    pub id: RuleId,
    pub local_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    pub remote_addr: String,
    pub remote_port: u16,
    /// Idle eviction threshold in seconds, values <= 1 disable eviction
    #[serde(default = "default_out_time")]
    pub out_time_secs: u64,
    /// Bytes accumulated since the last gigabyte rollover
    #[serde(default)]
    pub total_bytes: u64,
    /// Completed 1 GiB units
    #[serde(default)]
    pub total_gigabytes: u64,
    #[serde(default)]
    pub status: RuleStatus,
}

/// Idle threshold used when a rule does not specify one
pub const DEFAULT_OUT_TIME_SECS: u64 = 5;

fn default_out_time() -> u64 {
    DEFAULT_OUT_TIME_SECS
}

impl ForwardingRule {
    /// New running rule with zeroed counters
    pub fn new(
        local_port: u16,
        protocol: Protocol,
        remote_addr: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            id: 0,
            local_port,
            protocol,
            remote_addr: remote_addr.into(),
            remote_port,
            out_time_secs: DEFAULT_OUT_TIME_SECS,
            total_bytes: 0,
            total_gigabytes: 0,
            status: RuleStatus::Running,
        }
    }

    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.local_port, self.protocol)
    }

    /// Upstream endpoint as `host:port`, bracketing bare IPv6 literals
    pub fn upstream(&self) -> String {
        if self.remote_addr.contains(':') && !self.remote_addr.starts_with('[') {
            format!("[{}]:{}", self.remote_addr, self.remote_port)
        } else {
            format!("{}:{}", self.remote_addr, self.remote_port)
        }
    }

    /// Whether idle sessions of this rule are evicted at all
    pub fn evicts_idle(&self) -> bool {
        self.out_time_secs > 1
    }
}

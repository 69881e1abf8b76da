//! Configuration module for the port forwarder
//!
//! CLI arguments with environment variable fallbacks. Forwarding rules are not
//! configured here; they live in the rule store (`--rules_file`).

use anyhow::{anyhow, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::buffer_pool::{DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY};

/// Parse duration string (e.g., "5s", "2m") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '5s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Smallest relay buffer accepted; the UDP frame header alone takes 2 bytes
const MIN_BUFFER_SIZE: usize = 512;

/// CLI arguments for the forwarder
///
/// Supports environment variables with FORWARD_RS_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Multi-rule TCP/UDP port forwarder")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// TOML rules file; rules are kept in memory only when omitted
    #[arg(long, env = "FORWARD_RS_RULES_FILE")]
    pub rules_file: Option<PathBuf>,

    /// Local address every rule listens on
    #[arg(long, env = "FORWARD_RS_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// TCP port reserved for the administration surface; rules may not claim it
    #[arg(long, env = "FORWARD_RS_ADMIN_PORT")]
    pub admin_port: Option<u16>,

    /// Interval between traffic reports and idle sweeps (default: 5s)
    #[arg(long, env = "FORWARD_RS_STATS_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub stats_interval: Duration,

    /// Log mode: debug, info, warn, error (default: info)
    #[arg(long, env = "FORWARD_RS_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    // ==================== Performance Tuning ====================
    /// Relay buffer size in bytes (default: 8KB)
    #[arg(long, env = "FORWARD_RS_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE, help_heading = "Performance")]
    pub buffer_size: usize,

    /// Idle buffers kept for reuse (default: 1024)
    #[arg(long, env = "FORWARD_RS_BUFFER_POOL_CAPACITY", default_value_t = DEFAULT_POOL_CAPACITY, help_heading = "Performance")]
    pub buffer_pool_capacity: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "FORWARD_RS_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY on both legs of a session (default: true)
    #[arg(
        long,
        env = "FORWARD_RS_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        self.listen_ip()?;

        if self.stats_interval.is_zero() {
            return Err(anyhow!("stats_interval must be greater than 0"));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(anyhow!(
                "buffer_size must be at least {} bytes",
                MIN_BUFFER_SIZE
            ));
        }
        if self.buffer_size > u16::MAX as usize + 1 {
            return Err(anyhow!(
                "buffer_size must not exceed {} bytes",
                u16::MAX as usize + 1
            ));
        }
        if self.tcp_backlog <= 0 {
            return Err(anyhow!("tcp_backlog must be greater than 0"));
        }
        if self.admin_port == Some(0) {
            return Err(anyhow!("admin_port must be a positive port number"));
        }

        if let Some(ref path) = self.rules_file {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !ext.eq_ignore_ascii_case("toml") {
                return Err(anyhow!(
                    "Invalid rules file format: expected .toml extension"
                ));
            }
            if path.is_dir() {
                return Err(anyhow!("Rules file is a directory: {}", path.display()));
            }
        }

        Ok(())
    }

    fn listen_ip(&self) -> Result<IpAddr> {
        self.listen_host
            .parse()
            .map_err(|_| anyhow!("Invalid listen_host '{}': expected an IP address", self.listen_host))
    }
}

/// Runtime tuning shared by every rule
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Address rules bind on
    pub listen_ip: IpAddr,
    /// Stats tick period
    pub stats_interval: Duration,
    pub buffer_size: usize,
    pub pool_capacity: usize,
    pub tcp_backlog: i32,
    pub tcp_nodelay: bool,
    /// Reserved administration port (TCP only)
    pub admin_port: Option<u16>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            stats_interval: Duration::from_secs(5),
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            admin_port: None,
        }
    }
}

impl RuntimeConfig {
    /// Build from validated CLI arguments
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        Ok(Self {
            listen_ip: cli.listen_ip()?,
            stats_interval: cli.stats_interval,
            buffer_size: cli.buffer_size,
            pool_capacity: cli.buffer_pool_capacity,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            admin_port: cli.admin_port,
        })
    }
}

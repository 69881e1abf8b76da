use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a log level name, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Build the env filter: `RUST_LOG` wins, otherwise the crate at `log_mode`
fn build_filter(log_mode: &str) -> EnvFilter {
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        return env_filter;
    }
    let level = LogLevel::parse(log_mode).unwrap_or_default();
    EnvFilter::new(format!("forward_rs={}", level.as_str()))
}

pub fn init_logger(log_mode: &str) {
    tracing_subscriber::registry()
        .with(build_filter(log_mode))
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, warn};

    /// Rule lifecycle event
    pub fn rule(key: &str, event: &str) {
        info!(rule = key, event = event, "Rule");
    }

    /// Session lifecycle event
    pub fn session(rule: &str, link: &str, event: &str) {
        debug!(rule = rule, session = link, event = event, "Session");
    }

    /// Per-session I/O failure, terminal for that session only
    pub fn session_error(rule: &str, link: &str, op: &str, error: &std::io::Error) {
        warn!(rule = rule, session = link, op = op, error = %error, "Session failed");
    }
}

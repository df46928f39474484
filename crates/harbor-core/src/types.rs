use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Origin of a log chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    /// Container standard output
    Stdout,
    /// Container standard error
    Stderr,
    /// User-visible message about the container lifecycle
    Container,
    /// Internal diagnostic message
    Info,
    /// Internal diagnostic error
    Error,
}

impl LogType {
    /// Whether entries of this type are persisted into the operation state
    pub fn is_user_visible(self) -> bool {
        matches!(self, LogType::Stdout | LogType::Stderr | LogType::Container)
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogType::Stdout => "stdout",
            LogType::Stderr => "stderr",
            LogType::Container => "container",
            LogType::Info => "info",
            LogType::Error => "error",
        };
        f.write_str(name)
    }
}

/// A chunk of log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Where the chunk came from
    #[serde(rename = "type")]
    pub log_type: LogType,

    /// Raw text
    pub log: String,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(log_type: LogType, log: impl Into<String>) -> Self {
        Self {
            log_type,
            log: log.into(),
        }
    }

    /// Standard output chunk
    pub fn stdout(log: impl Into<String>) -> Self {
        Self::new(LogType::Stdout, log)
    }

    /// Standard error chunk
    pub fn stderr(log: impl Into<String>) -> Self {
        Self::new(LogType::Stderr, log)
    }

    /// User-visible lifecycle message
    pub fn container(log: impl Into<String>) -> Self {
        Self::new(LogType::Container, log)
    }

    /// Internal diagnostic message
    pub fn info(log: impl Into<String>) -> Self {
        Self::new(LogType::Info, log)
    }
}

/// Tunables of the execution engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of each operation's lifecycle event channel
    pub event_buffer: usize,

    /// Delay between two health check probes
    pub health_check_interval: Duration,

    /// How long startup health checks may take before giving up
    pub startup_timeout: Duration,

    /// Timeout of a single HTTP probe
    pub probe_timeout: Duration,

    /// How long log streaming may lag behind a container exit
    pub log_drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            health_check_interval: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(3),
            log_drain_timeout: Duration::from_secs(2),
        }
    }
}

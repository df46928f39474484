//! Observability setup for the Harbor compute node.

pub mod logging;

pub use logging::{init_logging, LogExt};

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log level filter (e.g., "info,harbor_core=debug"), overridden by `RUST_LOG`
    pub log_filter: String,
    /// Emit JSON lines instead of human readable output
    pub enable_json_logging: bool,
    /// Include source file and line in every event
    pub with_source_location: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "harbor-node".to_string(),
            log_filter: "info".to_string(),
            enable_json_logging: false,
            with_source_location: false,
        }
    }
}

/// Initialize the monitoring system
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    init_logging(config)
}

/// Shutdown the monitoring system
pub fn shutdown() {
    tracing::info!("Shutting down monitoring system");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MonitoringConfig::default();
        assert_eq!(config.service_name, "harbor-node");
        assert_eq!(config.log_filter, "info");
        assert!(!config.enable_json_logging);
    }
}

//! Configuration for the Harbor node
//!
//! Every setting comes from a `HARBOR_*` environment variable. Only the job
//! file is required; malformed values are reported and the default kept.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use harbor_core::FlowId;
use harbor_monitoring::MonitoringConfig;

use crate::error::{NodeError, NodeResult};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Job definition to run
    pub job_file: PathBuf,

    /// Flow id; the job file stem when absent
    #[serde(default)]
    pub flow_id: Option<String>,

    /// Directory of the flow state documents
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Docker binary
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Stop the job with `expired` after this many seconds
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,

    /// Interval between resource cache resyncs
    #[serde(default = "default_cache_resync_secs")]
    pub cache_resync_secs: u64,

    /// How long finished flows are kept
    #[serde(default = "default_flow_retention_hours")]
    pub flow_retention_hours: u64,

    /// Log filter
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit JSON logs
    #[serde(default)]
    pub log_json: bool,
}

// A century; keeps chrono durations in range
const MAX_RETENTION_HOURS: u64 = 24 * 365 * 100;

fn default_state_dir() -> PathBuf {
    PathBuf::from(".harbor/flows")
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_cache_resync_secs() -> u64 {
    600 // 10 minutes
}

fn default_flow_retention_hours() -> u64 {
    72
}

fn default_log_filter() -> String {
    "info,harbor_core=debug".to_string()
}

fn parse_or_warn<T: FromStr>(name: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Invalid {} value: {}", name, raw);
            None
        }
    }
}

impl NodeConfig {
    /// Configuration with every default, running the given job file
    pub fn new(job_file: impl Into<PathBuf>) -> Self {
        Self {
            job_file: job_file.into(),
            flow_id: None,
            state_dir: default_state_dir(),
            docker_bin: default_docker_bin(),
            job_timeout_secs: None,
            cache_resync_secs: default_cache_resync_secs(),
            flow_retention_hours: default_flow_retention_hours(),
            log_filter: default_log_filter(),
            log_json: false,
        }
    }

    /// Load configuration from environment variables
    pub fn load() -> NodeResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> NodeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let job_file = lookup("HARBOR_JOB_FILE")
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| NodeError::Config("HARBOR_JOB_FILE is required".to_string()))?;
        let mut config = Self::new(job_file);

        if let Some(flow_id) = lookup("HARBOR_FLOW_ID").filter(|v| !v.trim().is_empty()) {
            config.flow_id = Some(flow_id);
        }

        if let Some(state_dir) = lookup("HARBOR_STATE_DIR") {
            config.state_dir = PathBuf::from(state_dir);
        }

        if let Some(docker_bin) = lookup("HARBOR_DOCKER_BIN") {
            config.docker_bin = docker_bin;
        }

        if let Some(raw) = lookup("HARBOR_JOB_TIMEOUT_SECS") {
            if let Some(secs) = parse_or_warn::<u64>("HARBOR_JOB_TIMEOUT_SECS", &raw) {
                config.job_timeout_secs = (secs > 0).then_some(secs);
            }
        }

        if let Some(raw) = lookup("HARBOR_CACHE_RESYNC_SECS") {
            match parse_or_warn::<u64>("HARBOR_CACHE_RESYNC_SECS", &raw) {
                Some(0) => warn!("HARBOR_CACHE_RESYNC_SECS must be positive, keeping default"),
                Some(secs) => config.cache_resync_secs = secs,
                None => {}
            }
        }

        if let Some(raw) = lookup("HARBOR_FLOW_RETENTION_HOURS") {
            if let Some(hours) = parse_or_warn("HARBOR_FLOW_RETENTION_HOURS", &raw) {
                config.flow_retention_hours = hours;
            }
        }

        if let Some(filter) = lookup("HARBOR_LOG_FILTER") {
            config.log_filter = filter;
        }

        if let Some(raw) = lookup("HARBOR_LOG_JSON") {
            if let Some(json) = parse_or_warn("HARBOR_LOG_JSON", &raw) {
                config.log_json = json;
            }
        }

        info!(job_file = %config.job_file.display(), "Configuration loaded");
        Ok(config)
    }

    /// Id of the flow the node runs
    pub fn flow_id(&self) -> FlowId {
        let id = self.flow_id.clone().unwrap_or_else(|| {
            Path::new(&self.job_file)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "flow".to_string())
        });
        FlowId(id)
    }

    /// Job timeout, if any
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    /// Interval between resource cache resyncs
    pub fn cache_resync_interval(&self) -> Duration {
        Duration::from_secs(self.cache_resync_secs)
    }

    /// Retention window of finished flows
    pub fn flow_retention(&self) -> chrono::Duration {
        let hours = self.flow_retention_hours.min(MAX_RETENTION_HOURS);
        chrono::Duration::hours(hours as i64)
    }

    /// Monitoring settings derived from the node configuration
    pub fn monitoring(&self) -> MonitoringConfig {
        MonitoringConfig {
            service_name: "harbor-node".to_string(),
            log_filter: self.log_filter.clone(),
            enable_json_logging: self.log_json,
            ..MonitoringConfig::default()
        }
    }
}

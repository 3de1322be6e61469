//! Harness configuration with TOML support
//!
//! Loads from a TOML file, applies environment variable overrides, and
//! validates the result.
//!
//! # Example Configuration
//!
//! ```toml
//! [cluster]
//! node_count = 3
//! endpoints = ["127.0.0.1:54321", "127.0.0.1:54324", "127.0.0.1:54327"]
//!
//! # Used when no endpoints are configured
//! [cluster.spawn]
//! program = "java"
//! args = ["-jar", "server.jar", "-port", "{port}", "-name", "{cloud}"]
//! base_port = 54321
//! port_stride = 3
//!
//! [timeouts]
//! startup = "30s"
//! stabilize = "30s"
//! debounce = "3s"
//! poll_interval = "200ms"
//! max_poll_interval = "2s"
//! job = "60s"
//! drain = "60s"
//! settle = "10s"
//! request = "30s"
//! shutdown_grace = "5s"
//!
//! [logging]
//! level = "info"
//! ```

use crate::error::{HarnessError, HarnessResult};
use crate::poller::PollSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Complete configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub cluster: ClusterConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
}

/// Which nodes make up the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of nodes the cluster must reach
    pub node_count: usize,

    /// Running nodes to attach to (`host:port` or full URL)
    pub endpoints: Vec<String>,

    /// Local processes to launch when no endpoints are given
    pub spawn: Option<SpawnConfig>,
}

/// Local process launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    pub program: String,

    /// Arguments; `{port}`, `{index}` and `{cloud}` are substituted per node
    pub args: Vec<String>,

    pub host: String,

    pub base_port: u16,

    /// Port distance between consecutive nodes
    pub port_stride: u16,

    /// Cloud name shared by every spawned node
    pub cloud_name: String,

    /// Directory for per-node stdout/stderr capture
    pub log_dir: Option<PathBuf>,
}

/// Default timeouts used by every wait
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-node reachability window during build
    #[serde(with = "humantime_serde")]
    pub startup: Duration,

    #[serde(with = "humantime_serde")]
    pub stabilize: Duration,

    /// How long membership must hold before it is trusted
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub max_poll_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub job: Duration,

    #[serde(with = "humantime_serde")]
    pub drain: Duration,

    #[serde(with = "humantime_serde")]
    pub settle: Duration,

    /// Per HTTP request
    #[serde(with = "humantime_serde")]
    pub request: Duration,

    /// How long a launched process gets to exit before it is killed
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_count: 1,
            endpoints: Vec::new(),
            spawn: None,
        }
    }
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            host: "127.0.0.1".to_string(),
            base_port: 54321,
            port_stride: 3,
            cloud_name: "cloudharness".to_string(),
            log_dir: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(30),
            stabilize: Duration::from_secs(30),
            debounce: Duration::from_secs(3),
            poll_interval: Duration::from_millis(200),
            max_poll_interval: Duration::from_secs(2),
            job: Duration::from_secs(60),
            drain: Duration::from_secs(60),
            settle: Duration::from_secs(10),
            request: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Timeout multiplier for slow environments.
///
/// CI runners get 3x; `TEST_TIMEOUT_MULTIPLIER` overrides either way.
pub fn timeout_multiplier() -> u32 {
    if let Ok(multiplier) = std::env::var("TEST_TIMEOUT_MULTIPLIER") {
        if let Ok(m) = multiplier.parse::<u32>() {
            return m.max(1);
        }
    }

    if std::env::var("CI").is_ok() || std::env::var("GITHUB_ACTIONS").is_ok() {
        return 3;
    }

    1
}

impl TimeoutConfig {
    /// Multiply every wait timeout (not the intervals)
    pub fn scaled(&self, multiplier: u32) -> Self {
        Self {
            startup: self.startup.saturating_mul(multiplier),
            stabilize: self.stabilize.saturating_mul(multiplier),
            job: self.job.saturating_mul(multiplier),
            drain: self.drain.saturating_mul(multiplier),
            settle: self.settle.saturating_mul(multiplier),
            request: self.request.saturating_mul(multiplier),
            ..self.clone()
        }
    }

    /// Poll spec with the configured interval and backoff cap
    pub fn poll_spec(&self, operation: &str, timeout: Duration) -> PollSpec {
        PollSpec::new(operation, timeout, self.poll_interval).exponential(self.max_poll_interval)
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> HarnessResult<Self> {
        let path = path.as_ref();
        debug!("Reading harness configuration from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::Configuration {
            message: format!("Failed to read {:?}: {}", path, e),
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> HarnessResult<Self> {
        toml::from_str(content).map_err(|e| HarnessError::Configuration {
            message: format!("Failed to parse TOML configuration: {}", e),
        })
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoints) = std::env::var("CLOUDHARNESS_ENDPOINTS") {
            self.cluster.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(count) = std::env::var("CLOUDHARNESS_NODE_COUNT") {
            if let Ok(count) = count.parse() {
                self.cluster.node_count = count;
            }
        }
        if let Ok(timeout) = std::env::var("CLOUDHARNESS_STABILIZE_TIMEOUT") {
            if let Ok(timeout) = humantime_serde::re::humantime::parse_duration(&timeout) {
                self.timeouts.stabilize = timeout;
            }
        }
        if let Ok(debounce) = std::env::var("CLOUDHARNESS_DEBOUNCE") {
            if let Ok(debounce) = humantime_serde::re::humantime::parse_duration(&debounce) {
                self.timeouts.debounce = debounce;
            }
        }
        if let Ok(level) = std::env::var("CLOUDHARNESS_LOG_LEVEL") {
            self.logging.level = level;
        }

        self.timeouts = self.timeouts.scaled(timeout_multiplier());
    }

    /// Validate configuration
    pub fn validate(&self) -> HarnessResult<()> {
        if self.cluster.node_count == 0 {
            return Err(HarnessError::Configuration {
                message: "node_count must be at least 1".to_string(),
            });
        }

        if self.cluster.endpoints.is_empty() && self.cluster.spawn.is_none() {
            return Err(HarnessError::Configuration {
                message: "either cluster.endpoints or cluster.spawn must be configured"
                    .to_string(),
            });
        }

        if let Some(spawn) = &self.cluster.spawn {
            if self.cluster.endpoints.is_empty() && spawn.program.is_empty() {
                return Err(HarnessError::Configuration {
                    message: "cluster.spawn.program cannot be empty".to_string(),
                });
            }
            if spawn.port_stride == 0 {
                return Err(HarnessError::Configuration {
                    message: "cluster.spawn.port_stride must be greater than 0".to_string(),
                });
            }
        }

        if self.timeouts.poll_interval.is_zero() {
            return Err(HarnessError::Configuration {
                message: "poll_interval must be greater than 0".to_string(),
            });
        }

        if self.timeouts.debounce >= self.timeouts.stabilize {
            return Err(HarnessError::Configuration {
                message: format!(
                    "debounce ({:?}) must be shorter than the stabilize timeout ({:?})",
                    self.timeouts.debounce, self.timeouts.stabilize
                ),
            });
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(HarnessError::Configuration {
                    message: format!("Invalid log level: {}", self.logging.level),
                })
            }
        }

        Ok(())
    }
}

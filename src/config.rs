//! Configuration management
//!
//! A single structured YAML document loaded at startup, with typed
//! per-section defaults, validation, and `LABFLEET_*` environment
//! overrides. Worker templates live in the same document and are seeded
//! into the document store when the process starts. Configuration errors
//! refuse startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::worker::WorkerTemplate;
use crate::error::{ControlError, ControlResult};

/// Top-level control-plane configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub controller: ControllerConfig,
    pub telemetry: TelemetryConfig,
    pub fanout: FanoutConfig,
    /// Worker templates seeded into the document store at startup
    pub templates: Vec<WorkerTemplate>,
}

impl ControlConfig {
    /// Load from a YAML file, apply environment overrides, validate.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ControlResult<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ControlError::Config(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::load_from_str(&content)
    }

    /// Load from a YAML string, apply environment overrides, validate.
    pub fn load_from_str(content: &str) -> ControlResult<Self> {
        let mut config: ControlConfig = serde_yaml::from_str(content)
            .map_err(|e| ControlError::Config(format!("malformed configuration: {}", e)))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    pub fn load_from_env() -> ControlResult<Self> {
        let mut config = ControlConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LABFLEET_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("LABFLEET_LISTEN_ADDR") {
            self.api.listen_addr = val;
        }
        if let Ok(val) = std::env::var("LABFLEET_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("LABFLEET_INTERNAL_TOKEN") {
            self.api.internal_token = val;
        }
    }

    /// Validate every section; any failure refuses startup.
    pub fn validate(&self) -> ControlResult<()> {
        self.logging.validate()?;
        self.scheduler.validate()?;
        self.controller.validate()?;
        self.fanout.validate()?;
        let mut names = std::collections::BTreeSet::new();
        for template in &self.templates {
            template.validate()?;
            if !names.insert(template.name.as_str()) {
                return Err(ControlError::Config(format!(
                    "duplicate worker template {}",
                    template.name
                )));
            }
        }
        Ok(())
    }
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub region: String,
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "labfleet".to_string(),
            region: "eu-west-1".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl LoggingConfig {
    fn validate(&self) -> ControlResult<()> {
        let valid = ["trace", "debug", "info", "warn", "error"];
        if !valid.contains(&self.level.as_str()) {
            return Err(ControlError::Config(format!(
                "invalid log level: {}",
                self.level
            )));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// HTTP adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
    /// Bearer token the scheduler/controller identities present on the
    /// internal endpoints
    pub internal_token: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8087".to_string(),
            internal_token: "labfleet-internal".to_string(),
        }
    }
}

/// Document-store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub definition_cache_ttl_secs: u64,
}

impl StorageConfig {
    pub fn definition_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.definition_cache_ttl_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./labfleet-data".to_string(),
            definition_cache_ttl_secs: 300,
        }
    }
}

/// Placement scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Leader-lease duration in seconds
    pub lease_ttl_secs: u64,
    /// Periodic reconciliation cadence in seconds
    pub tick_secs: u64,
    /// Pre-timeslot instantiation margin in seconds
    pub lead_time_secs: u64,
}

impl SchedulerConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn lead_time(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lead_time_secs as i64)
    }

    fn validate(&self) -> ControlResult<()> {
        if self.lease_ttl_secs == 0 || self.tick_secs == 0 {
            return Err(ControlError::Config(
                "scheduler lease_ttl and tick must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 15,
            tick_secs: 30,
            lead_time_secs: 15 * 60,
        }
    }
}

/// Reconciliation controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Reconcile cadence in seconds
    pub tick_secs: u64,
    /// Scale-up trigger before timeslot start, in seconds (worker boot plus
    /// lab instantiation)
    pub total_lead_time_secs: u64,
    /// Idleness required before a worker is drained, in seconds
    pub scale_down_grace_secs: u64,
    /// Fallback drain deadline in seconds when a template declares none
    pub drain_timeout_default_secs: u64,
    /// Consecutive ticks a running instance may go unreported before it is
    /// stopped
    pub inactive_ticks: u32,
    /// Per-action timeout in seconds
    pub action_timeout_secs: u64,
    /// Bounded parallelism of the act phase
    pub max_parallel_actions: usize,
    /// Instantiation attempts before the instance is quarantined
    pub instantiation_retry_budget: u32,
}

impl ControllerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn total_lead_time(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.total_lead_time_secs as i64)
    }

    pub fn scale_down_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.scale_down_grace_secs as i64)
    }

    pub fn drain_timeout_default(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.drain_timeout_default_secs as i64)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    fn validate(&self) -> ControlResult<()> {
        if self.tick_secs == 0 {
            return Err(ControlError::Config(
                "controller tick must be non-zero".to_string(),
            ));
        }
        if self.max_parallel_actions == 0 {
            return Err(ControlError::Config(
                "controller max_parallel_actions must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            total_lead_time_secs: 35 * 60,
            scale_down_grace_secs: 30 * 60,
            drain_timeout_default_secs: 4 * 3600,
            inactive_ticks: 3,
            action_timeout_secs: 60,
            max_parallel_actions: 8,
            instantiation_retry_budget: 3,
        }
    }
}

/// Worker telemetry polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Per-worker metrics cadence in seconds
    pub poll_interval_secs: u64,
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.poll_interval_secs as i64)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
        }
    }
}

/// Event fan-out tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Depth of each subscriber's bounded queue
    pub queue_depth: usize,
    /// How long an enqueue may block before the event is dropped for that
    /// subscriber, in milliseconds
    pub enqueue_timeout_ms: u64,
    /// Keep-alive cadence in seconds
    pub heartbeat_secs: u64,
}

impl FanoutConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    fn validate(&self) -> ControlResult<()> {
        if self.queue_depth == 0 {
            return Err(ControlError::Config(
                "fanout queue_depth must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            enqueue_timeout_ms: 100,
            heartbeat_secs: 30,
        }
    }
}

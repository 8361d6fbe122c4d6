//! Configuration management

use crate::types::LaneConfig;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub lanes: Vec<LaneConfig>,
    pub stream: StreamConfig,
    pub saga: SagaConfig,
    pub observability: ObservabilityConfig,
}

/// Bind address for the surrounding transport layer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Identifier stamped on every published event envelope
    pub node_id: String,
    /// Maximum redirect hops before a submission is rejected
    pub redirect_max_depth: usize,
    /// Grace period for draining lanes on stop
    pub shutdown_timeout_ms: u64,
    /// Initial backoff between task retry attempts
    pub retry_initial_backoff_ms: u64,
    /// Backoff ceiling
    pub retry_max_backoff_ms: u64,
    /// Exponential backoff multiplier
    pub retry_backoff_multiplier: f64,
    /// Add random jitter to backoff delays
    pub retry_jitter: bool,
}

/// Stream bridge configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Per-subscriber channel capacity
    pub subscriber_buffer: usize,
    /// Events retained per workflow for resubscribe replay
    pub replay_window: usize,
    /// Age after which a slow consumer is dropped
    pub slow_consumer_max_age_ms: u64,
    /// Sweep interval for the cleanup task
    pub cleanup_interval_ms: u64,
}

/// Saga orchestrator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SagaConfig {
    /// Compensation retry ceiling for steps that do not set their own
    pub max_compensation_retries: u32,
    /// Retention for WAL and checkpoints of terminal sagas
    pub retention_ms: u64,
    /// Sweep interval for the retention sweeper
    pub sweep_interval_ms: u64,
    /// Deletions per sweep batch
    pub sweep_batch: usize,
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub tracing_enabled: bool,
    pub otlp_endpoint: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Log format
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Config {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.request_timeout_ms", 30_000)?
            .set_default("engine.node_id", "node-local")?
            .set_default("engine.redirect_max_depth", 1)?
            .set_default("engine.shutdown_timeout_ms", 30_000)?
            .set_default("engine.retry_initial_backoff_ms", 100)?
            .set_default("engine.retry_max_backoff_ms", 30_000)?
            .set_default("engine.retry_backoff_multiplier", 2.0)?
            .set_default("engine.retry_jitter", true)?
            .set_default("stream.subscriber_buffer", 64)?
            .set_default("stream.replay_window", 1024)?
            .set_default("stream.slow_consumer_max_age_ms", 300_000)?
            .set_default("stream.cleanup_interval_ms", 60_000)?
            .set_default("saga.max_compensation_retries", 3)?
            .set_default("saga.retention_ms", 7 * 24 * 3600 * 1000)?
            .set_default("saga.sweep_interval_ms", 3_600_000)?
            .set_default("saga.sweep_batch", 100)?
            .set_default("observability.metrics_enabled", true)?
            .set_default("observability.metrics_port", 9090)?
            .set_default("observability.tracing_enabled", false)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "compact")?;

        // Load from config file if exists
        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("FLOWLANE")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration, collecting every violation
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server port must be greater than 0".to_string());
        }
        if self.engine.node_id.is_empty() {
            errors.push("engine node_id must not be empty".to_string());
        }
        if self.engine.retry_backoff_multiplier < 1.0 {
            errors.push("retry backoff multiplier must be at least 1.0".to_string());
        }
        if self.saga.retention_ms == 0 {
            errors.push("saga retention must be greater than 0".to_string());
        }
        if self.stream.replay_window == 0 {
            errors.push("stream replay window must be greater than 0".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for lane in &self.lanes {
            if let Err(e) = lane.validate() {
                errors.push(e.to_string());
            }
            if !names.insert(lane.name.as_str()) {
                errors.push(format!("duplicate lane name: {}", lane.name));
            }
        }
        for lane in &self.lanes {
            if let Some(target) = &lane.redirect_target {
                if !self.lanes.iter().any(|l| &l.name == target)
                    && target != crate::types::DEFAULT_LANE
                {
                    errors.push(format!(
                        "lane {} redirects to unknown lane {}",
                        lane.name, target
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                request_timeout_ms: 30_000,
            },
            engine: EngineConfig::default(),
            lanes: Vec::new(),
            stream: StreamConfig::default(),
            saga: SagaConfig::default(),
            observability: ObservabilityConfig {
                metrics_enabled: true,
                metrics_port: 9090,
                tracing_enabled: false,
                otlp_endpoint: None,
                log_level: "info".to_string(),
                log_format: LogFormat::Compact,
            },
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: "node-local".to_string(),
            redirect_max_depth: 1,
            shutdown_timeout_ms: 30_000,
            retry_initial_backoff_ms: 100,
            retry_max_backoff_ms: 30_000,
            retry_backoff_multiplier: 2.0,
            retry_jitter: true,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
            replay_window: 1024,
            slow_consumer_max_age_ms: 300_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_compensation_retries: 3,
            retention_ms: 7 * 24 * 3600 * 1000,
            sweep_interval_ms: 3_600_000,
            sweep_batch: 100,
        }
    }
}

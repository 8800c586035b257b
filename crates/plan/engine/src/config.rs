//! Configuration for the plan engine

use serde::{Deserialize, Serialize};

use crate::{EngineError, EngineResult};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker substrate configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Wait/resume broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker substrate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of dispatched units of work running at once
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

/// Wait/resume broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Keep responses that arrive before their wait is registered
    #[serde(default = "default_true")]
    pub retain_early_responses: bool,

    /// Upper bound on retained early responses
    #[serde(default = "default_max_retained_responses")]
    pub max_retained_responses: usize,

    /// How many delivered or cancelled correlation ids are remembered to
    /// drop duplicate and late completions; the oldest are forgotten first
    #[serde(default = "default_max_settled_ids")]
    pub max_settled_ids: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            retain_early_responses: true,
            max_retained_responses: default_max_retained_responses(),
            max_settled_ids: default_max_settled_ids(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            timestamps: true,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_max_concurrent_tasks() -> usize {
    64
}

fn default_max_retained_responses() -> usize {
    10_000
}

fn default_max_settled_ids() -> usize {
    100_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration.
    ///
    /// Sources, lowest precedence first: built-in defaults, the optional
    /// file at `path`, then `PLAN_ENGINE_*` environment variables with `__`
    /// between sections (`PLAN_ENGINE_WORKER__MAX_CONCURRENT_TASKS=8`).
    pub fn load(path: Option<&str>) -> EngineResult<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PLAN_ENGINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.worker.max_concurrent_tasks == 0 {
            return Err(EngineError::InvalidConfig(
                "worker.max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.broker.max_settled_ids == 0 {
            return Err(EngineError::InvalidConfig(
                "broker.max_settled_ids must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use tracing::info;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 8;
const DEFAULT_DB_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// Toggles for workflow invariants the source system enforces
/// inconsistently. Each one guards a check that some deployments want
/// strict and others leave advisory.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Require every bound issue's spare part demand to be coverable by
    /// current stock before a task is (re)exposed for fixer assignment.
    #[serde(default)]
    pub enforce_stock_before_fixer: bool,

    /// Move a request to awaiting-confirmation automatically once all of
    /// its non-cancelled tasks complete and no issue is left pending.
    #[serde(default = "default_true")]
    pub auto_confirm_on_completion: bool,

    /// Refuse task creation while the request already has an open
    /// (non-terminal) task.
    #[serde(default)]
    pub single_open_task_per_request: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            enforce_stock_before_fixer: false,
            auto_confirm_on_completion: true,
            single_open_task_per_request: false,
        }
    }
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1, message = "database_url must not be empty"))]
    pub database_url: String,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level filter (overridable by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    /// Capacity of the in-process event channel
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Workflow enforcement toggles
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    /// Builds a configuration programmatically with defaults for every
    /// optional field. Used by tests and embedding binaries.
    pub fn new(database_url: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            environment: environment.into(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_json: false,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            db_min_connections: DEFAULT_DB_MIN_CONNECTIONS,
            db_connect_timeout_secs: DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            db_acquire_timeout_secs: DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
            db_idle_timeout_secs: DEFAULT_DB_IDLE_TIMEOUT_SECS,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            workflow: WorkflowConfig::default(),
        }
    }

    /// Loads configuration from `config/default.toml`, an optional
    /// per-environment file, and `APP_`-prefixed environment variables
    /// (e.g. `APP_DATABASE_URL`, `APP_WORKFLOW__ENFORCE_STOCK_BEFORE_FIXER`).
    pub fn load() -> Result<Self, ConfigError> {
        let run_env = env::var("APP_ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let mut builder = Config::builder()
            .add_source(File::from(Path::new(CONFIG_DIR).join("default")).required(false))
            .add_source(File::from(Path::new(CONFIG_DIR).join(&run_env)).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"));

        builder = builder.set_default("environment", run_env.clone())?;

        let cfg: AppConfig = builder.build()?.try_deserialize()?;
        cfg.validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        info!(environment = %cfg.environment, "configuration loaded");
        Ok(cfg)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}

fn default_db_min_connections() -> u32 {
    DEFAULT_DB_MIN_CONNECTIONS
}

fn default_db_connect_timeout_secs() -> u64 {
    DEFAULT_DB_CONNECT_TIMEOUT_SECS
}

fn default_db_acquire_timeout_secs() -> u64 {
    DEFAULT_DB_ACQUIRE_TIMEOUT_SECS
}

fn default_db_idle_timeout_secs() -> u64 {
    DEFAULT_DB_IDLE_TIMEOUT_SECS
}

fn default_event_buffer_size() -> usize {
    DEFAULT_EVENT_BUFFER_SIZE
}

fn default_true() -> bool {
    true
}

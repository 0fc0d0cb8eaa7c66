//! Configuration module for podsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for podsync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub quota: QuotaConfig,
    pub retry: RetryConfig,
    pub traversal: TraversalConfig,
    pub export: ExportConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Remote API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the REST API.
    pub base_url: String,
    /// Environment variable holding the OAuth access token.
    pub access_token_env: String,
    /// User-Agent header sent with every request.
    pub user_agent: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

/// Request quota settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Lightweight calls permitted per window.
    pub general_per_hour: u32,
    /// Heavyweight calls permitted per window.
    pub heavy_per_hour: u32,
    /// Length of the quota window in seconds.
    pub window_secs: u64,
    /// Minimum gap between consecutive dispatches in milliseconds.
    pub dispatch_delay_ms: u64,
    /// Wait applied when the server rate-limits without a Retry-After.
    pub default_retry_after_secs: u64,
    /// Endpoint fragments that mark a GET as heavyweight.
    pub heavy_endpoints: Vec<String>,
    /// Wait for exhausted quotas instead of stopping the job.
    pub auto_wait: bool,
}

/// Backoff settings for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

/// Hierarchy traversal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    /// Apps processed concurrently within one workspace.
    pub app_concurrency: usize,
    /// Attempts per organization before it is recorded as failed.
    pub max_org_attempts: u32,
    /// Page size for file listings (the service caps it at 100).
    pub files_page_size: u32,
    /// Pause between organizations in milliseconds.
    pub unit_delay_ms: u64,
    /// Export each app's items as a spreadsheet during the scan.
    pub export_apps: bool,
    /// Age in minutes below which a completed scan may be reused.
    pub reuse_recent_minutes: u64,
}

/// Asynchronous export polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

/// Local storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding jobs and checkpoints.
    pub database: PathBuf,
    /// Root directory for the backup tree.
    pub backup_root: PathBuf,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `pretty` or `json`.
    pub format: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/podsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("podsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Config::default()
// ---------------------------------------------------------------------------

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.podio.com".to_string(),
            access_token_env: "PODSYNC_ACCESS_TOKEN".to_string(),
            user_agent: format!("podsync/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 60,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            general_per_hour: 1000,
            heavy_per_hour: 250,
            window_secs: 3600,
            dispatch_delay_ms: 50,
            default_retry_after_secs: 60,
            heavy_endpoints: vec![
                "/file/".to_string(),
                "/xlsx/".to_string(),
                "/download_link".to_string(),
            ],
            auto_wait: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_jitter_ms: 1000,
        }
    }
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            app_concurrency: 3,
            max_org_attempts: 3,
            files_page_size: 100,
            unit_delay_ms: 100,
            export_apps: false,
            reuse_recent_minutes: 60,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            timeout_secs: 30 * 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("podsync");
        Self {
            database: data_dir.join("podsync.db"),
            backup_root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("PodioBackup"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Duration accessors
// ---------------------------------------------------------------------------

impl QuotaConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_delay_ms)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }
}

impl ExportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TraversalConfig {
    pub fn unit_delay(&self) -> Duration {
        Duration::from_millis(self.unit_delay_ms)
    }

    pub fn reuse_recent(&self) -> Duration {
        Duration::from_secs(self.reuse_recent_minutes * 60)
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"quota.window_secs"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];

/// Largest page the file listing endpoint accepts.
const MAX_FILES_PAGE_SIZE: u32 = 100;

fn must_be_positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- remote ---
        if !self.remote.base_url.starts_with("http://")
            && !self.remote.base_url.starts_with("https://")
        {
            errors.push(ValidationError {
                field: "remote.base_url".into(),
                message: format!("must be an http(s) URL: {}", self.remote.base_url),
            });
        }
        if self.remote.access_token_env.trim().is_empty() {
            errors.push(ValidationError {
                field: "remote.access_token_env".into(),
                message: "must name an environment variable".into(),
            });
        }
        must_be_positive(
            &mut errors,
            "remote.request_timeout_secs",
            self.remote.request_timeout_secs,
        );

        // --- quota ---
        must_be_positive(
            &mut errors,
            "quota.general_per_hour",
            u64::from(self.quota.general_per_hour),
        );
        must_be_positive(
            &mut errors,
            "quota.heavy_per_hour",
            u64::from(self.quota.heavy_per_hour),
        );
        must_be_positive(&mut errors, "quota.window_secs", self.quota.window_secs);

        // --- retry ---
        must_be_positive(
            &mut errors,
            "retry.max_attempts",
            u64::from(self.retry.max_attempts),
        );
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push(ValidationError {
                field: "retry.max_delay_ms".into(),
                message: format!(
                    "max_delay_ms ({}) must not be below base_delay_ms ({})",
                    self.retry.max_delay_ms, self.retry.base_delay_ms
                ),
            });
        }

        // --- traversal ---
        must_be_positive(
            &mut errors,
            "traversal.app_concurrency",
            self.traversal.app_concurrency as u64,
        );
        must_be_positive(
            &mut errors,
            "traversal.max_org_attempts",
            u64::from(self.traversal.max_org_attempts),
        );
        if self.traversal.files_page_size == 0
            || self.traversal.files_page_size > MAX_FILES_PAGE_SIZE
        {
            errors.push(ValidationError {
                field: "traversal.files_page_size".into(),
                message: format!("must be in range 1..={MAX_FILES_PAGE_SIZE}"),
            });
        }

        // --- export ---
        must_be_positive(
            &mut errors,
            "export.poll_interval_secs",
            self.export.poll_interval_secs,
        );
        if self.export.timeout_secs < self.export.poll_interval_secs {
            errors.push(ValidationError {
                field: "export.timeout_secs".into(),
                message: "must not be shorter than the poll interval".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use podsync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .backup_root(PathBuf::from("/srv/podio-backup"))
///     .quota_auto_wait(false)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- remote ---

    pub fn remote_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.remote.base_url = url.into();
        self
    }

    pub fn remote_access_token_env(mut self, var: impl Into<String>) -> Self {
        self.config.remote.access_token_env = var.into();
        self
    }

    // --- quota ---

    pub fn quota_limits(mut self, general_per_hour: u32, heavy_per_hour: u32) -> Self {
        self.config.quota.general_per_hour = general_per_hour;
        self.config.quota.heavy_per_hour = heavy_per_hour;
        self
    }

    pub fn quota_window_secs(mut self, seconds: u64) -> Self {
        self.config.quota.window_secs = seconds;
        self
    }

    pub fn quota_dispatch_delay_ms(mut self, millis: u64) -> Self {
        self.config.quota.dispatch_delay_ms = millis;
        self
    }

    pub fn quota_auto_wait(mut self, auto_wait: bool) -> Self {
        self.config.quota.auto_wait = auto_wait;
        self
    }

    // --- retry ---

    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn retry_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.config.retry.base_delay_ms = base;
        self.config.retry.max_delay_ms = max;
        self
    }

    // --- traversal ---

    pub fn app_concurrency(mut self, n: usize) -> Self {
        self.config.traversal.app_concurrency = n;
        self
    }

    pub fn max_org_attempts(mut self, n: u32) -> Self {
        self.config.traversal.max_org_attempts = n;
        self
    }

    pub fn files_page_size(mut self, n: u32) -> Self {
        self.config.traversal.files_page_size = n;
        self
    }

    pub fn export_apps(mut self, export: bool) -> Self {
        self.config.traversal.export_apps = export;
        self
    }

    // --- export ---

    pub fn export_poll_interval_secs(mut self, seconds: u64) -> Self {
        self.config.export.poll_interval_secs = seconds;
        self
    }

    pub fn export_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.export.timeout_secs = seconds;
        self
    }

    // --- storage ---

    pub fn database(mut self, path: PathBuf) -> Self {
        self.config.storage.database = path;
        self
    }

    pub fn backup_root(mut self, path: PathBuf) -> Self {
        self.config.storage.backup_root = path;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

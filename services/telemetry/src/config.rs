use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the telemetry service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Image blob storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Frame retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Timelapse reconstruction configuration
    #[serde(default)]
    pub timelapse: TimelapseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Accounts created at startup
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// How long a writer waits on a locked database, in seconds
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory image payloads are written beneath
    #[serde(default = "default_storage_root")]
    pub root: String,
}

/// Frame retention configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Minimum spacing between persisted frames of one stream, in seconds
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Mean luminance (0-255) at or above which a frame counts as daytime
    #[serde(default = "default_brightness_threshold")]
    pub brightness_threshold: f64,
}

/// Timelapse reconstruction configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TimelapseConfig {
    /// Cursor advance after each selected frame, in seconds
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,
    /// Deadline for a single reconstruction, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum request body size (base64 images are large)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Accounts ensured at startup
#[derive(Debug, Clone, Deserialize)]
pub struct SeedConfig {
    /// Username of the administrator account
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// API key of the administrator account; generated when absent
    #[serde(default)]
    pub admin_api_key: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "telemetry-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_database_url() -> String {
    "sqlite://data.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_storage_root() -> String {
    "uploads".to_string()
}

// 29 minutes. Deployment notes have described this as "10 minutes"; the
// literal is what the devices in the field were tuned against.
fn default_min_interval_secs() -> u64 {
    1740
}

fn default_brightness_threshold() -> f64 {
    50.0
}

fn default_step_secs() -> u64 {
    3600
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024 // 16MB
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_true() -> bool {
    true
}

/// Largest interval, in seconds, a chrono Duration can hold
const MAX_INTERVAL_SECS: u64 = (i64::MAX / 1000) as u64;

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "telemetry-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/telemetry").required(false))
            .add_source(config::File::with_name("/etc/telemetry/telemetry").required(false))
            // Override with environment variables
            // TELEMETRY__RETENTION__MIN_INTERVAL_SECS -> retention.min_interval_secs
            .add_source(
                config::Environment::with_prefix("TELEMETRY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the duration conversions cannot represent
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retention.min_interval_secs > MAX_INTERVAL_SECS {
            anyhow::bail!("retention.min_interval_secs must be at most {}", MAX_INTERVAL_SECS);
        }
        if self.timelapse.step_secs == 0 || self.timelapse.step_secs > MAX_INTERVAL_SECS {
            anyhow::bail!("timelapse.step_secs must be between 1 and {}", MAX_INTERVAL_SECS);
        }
        if self.timelapse.timeout_secs == 0 || self.timelapse.timeout_secs > MAX_INTERVAL_SECS {
            anyhow::bail!("timelapse.timeout_secs must be between 1 and {}", MAX_INTERVAL_SECS);
        }
        if !(0.0..=255.0).contains(&self.retention.brightness_threshold) {
            anyhow::bail!("retention.brightness_threshold must be within 0-255");
        }
        Ok(())
    }

    /// Get the timelapse deadline as Duration
    pub fn timelapse_timeout(&self) -> Duration {
        Duration::from_secs(self.timelapse.timeout_secs)
    }
}

impl RetentionConfig {
    /// Minimum inter-frame interval as a chrono Duration
    pub fn min_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_interval_secs as i64)
    }
}

impl TimelapseConfig {
    /// Cursor step as a chrono Duration
    pub fn step(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.step_secs as i64)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            busy_timeout_secs: default_busy_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval_secs(),
            brightness_threshold: default_brightness_threshold(),
        }
    }
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            step_secs: default_step_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            admin_username: default_admin_username(),
            admin_api_key: None,
        }
    }
}

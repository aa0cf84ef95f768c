//! Configuration management for artifact-depot
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// HTTP API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Artifact storage backends
    #[serde(default)]
    pub storage: StorageConfig,

    /// Proxy cache defaults and eviction schedule
    #[serde(default)]
    pub cache: CacheConfig,

    /// Upstream HTTP client settings
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Container registry listener settings
    #[serde(default)]
    pub container: ContainerConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml);
        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables with prefix ARTIFACT_DEPOT_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(host) = std::env::var("ARTIFACT_DEPOT_SERVER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("ARTIFACT_DEPOT_SERVER_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid port number".to_string()))?;
        }
        if let Ok(url) = std::env::var("ARTIFACT_DEPOT_PUBLIC_URL") {
            config.server.public_url = Some(url);
        }

        if let Ok(path) = std::env::var("ARTIFACT_DEPOT_DATABASE_PATH") {
            config.database.path = path;
        }

        if let Ok(root) = std::env::var("ARTIFACT_DEPOT_STORAGE_ROOT") {
            config.storage.backends.insert(
                config.storage.default_backend.clone(),
                StorageBackendConfig::Filesystem { root },
            );
        }

        if let Ok(enabled) = std::env::var("ARTIFACT_DEPOT_AUTH_ENABLED") {
            config.auth.enabled = enabled.parse().unwrap_or(true);
        }
        if let Ok(hash) = std::env::var("ARTIFACT_DEPOT_AUTH_ADMIN_PASSWORD_HASH") {
            config.auth.admin_password_hash = Some(hash);
        }

        if let Ok(key) = std::env::var("ARTIFACT_DEPOT_CONTAINER_SIGNING_KEY") {
            config.container.signing_key = Some(key);
        }

        if let Ok(enabled) = std::env::var("ARTIFACT_DEPOT_OTEL_ENABLED") {
            config.otel.enabled = enabled.parse().unwrap_or(false);
        }
        if let Ok(endpoint) = std::env::var("ARTIFACT_DEPOT_OTEL_ENDPOINT") {
            config.otel.endpoint = Some(endpoint);
        }

        if let Ok(level) = std::env::var("ARTIFACT_DEPOT_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container.port_range_start > self.container.port_range_end {
            return Err(ConfigError::InvalidValue(format!(
                "container port range {}-{} is empty",
                self.container.port_range_start, self.container.port_range_end
            )));
        }
        if !self
            .storage
            .backends
            .contains_key(&self.storage.default_backend)
        {
            return Err(ConfigError::MissingRequired(format!(
                "storage backend '{}'",
                self.storage.default_backend
            )));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally visible base URL used in generated index documents
    #[serde(default)]
    pub public_url: Option<String>,

    /// Read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Write timeout in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Largest request body accepted, in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl ServerConfig {
    /// Base URL clients use to reach the API server
    pub fn base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_max_upload_bytes() -> usize {
    1024 * 1024 * 1024
}

fn default_read_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    300
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// Whether authentication is enforced on the API
    #[serde(default = "default_auth_enabled")]
    pub enabled: bool,

    /// Argon2 hash of the admin password
    #[serde(default)]
    pub admin_password_hash: Option<String>,

    /// Whether unauthenticated callers may read repositories that do not require auth
    #[serde(default = "default_anonymous_read")]
    pub anonymous_read: bool,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: AuthRateLimitConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: default_auth_enabled(),
            admin_password_hash: None,
            anonymous_read: default_anonymous_read(),
            rate_limit: AuthRateLimitConfig::default(),
        }
    }
}

fn default_auth_enabled() -> bool {
    true
}

fn default_anonymous_read() -> bool {
    true
}

/// Rate limiting configuration for authentication failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthRateLimitConfig {
    /// Maximum number of failed attempts before blocking
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Duration to block after max failures (in seconds)
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,

    /// Window after which failure counts reset (in seconds)
    #[serde(default = "default_window_duration")]
    pub window_duration_secs: u64,
}

impl Default for AuthRateLimitConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            block_duration_secs: default_block_duration(),
            window_duration_secs: default_window_duration(),
        }
    }
}

fn default_max_failures() -> u32 {
    10
}

fn default_block_duration() -> u64 {
    300
}

fn default_window_duration() -> u64 {
    600
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "/data/db/artifact-depot.db".to_string()
}

/// Storage backends available to repositories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Backend used when a repository has no override
    #[serde(default = "default_storage_backend")]
    pub default_backend: String,

    /// Named backends
    #[serde(default = "default_storage_backends")]
    pub backends: HashMap<String, StorageBackendConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_backend: default_storage_backend(),
            backends: default_storage_backends(),
        }
    }
}

fn default_storage_backend() -> String {
    "default".to_string()
}

fn default_storage_backends() -> HashMap<String, StorageBackendConfig> {
    let mut backends = HashMap::new();
    backends.insert(
        default_storage_backend(),
        StorageBackendConfig::Filesystem {
            root: "/data/artifacts".to_string(),
        },
    );
    backends
}

/// A single storage backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackendConfig {
    /// Local directory tree
    Filesystem {
        /// Root directory
        root: String,
    },
    /// Process memory, lost on restart
    Memory,
}

/// Proxy cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// TTL recorded on entries when a repository does not set one
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// Entries older than this are evicted by the sweep
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Per-repository entry ceiling enforced by the sweep
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Interval between eviction sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
            retention_secs: default_retention(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_retention() -> u64 {
    30 * 24 * 3600
}

fn default_max_entries() -> usize {
    100_000
}

fn default_sweep_interval() -> u64 {
    3600
}

/// Upstream HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retry policy for transient upstream failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}

/// Retry configuration for upstream calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to add jitter to backoff
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// Container registry listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerConfig {
    /// Address listeners bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// First port handed out when a repository does not pin one
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last port handed out when a repository does not pin one
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// `service` value in bearer challenges and issued tokens
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Lifetime of issued bearer tokens in seconds
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// HMAC key for issued tokens; random per process when unset
    #[serde(default)]
    pub signing_key: Option<String>,

    /// Directory for in-progress blob uploads
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Upload sessions without a chunk for this long are discarded
    #[serde(default = "default_upload_idle")]
    pub upload_idle_secs: u64,

    /// Largest blob a single upload may carry
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            service_name: default_service_name(),
            token_ttl_secs: default_token_ttl(),
            signing_key: None,
            upload_dir: default_upload_dir(),
            upload_idle_secs: default_upload_idle(),
            max_blob_bytes: default_max_blob_bytes(),
        }
    }
}

fn default_port_range_start() -> u16 {
    5000
}

fn default_port_range_end() -> u16 {
    5099
}

fn default_service_name() -> String {
    "artifact-depot".to_string()
}

fn default_token_ttl() -> u64 {
    300
}

fn default_upload_idle() -> u64 {
    3600
}

fn default_max_blob_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_upload_dir() -> String {
    std::env::temp_dir()
        .join("artifact-depot-uploads")
        .to_string_lossy()
        .into_owned()
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Whether OTLP export is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Service name reported to the collector
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: default_service_name(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax
fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .expect("Invalid regex pattern for environment variable expansion");

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Parse complete configuration from YAML
    #[test]
    fn test_parse_complete_yaml_config() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 9090
  public_url: "https://depot.example.com/"

auth:
  enabled: true
  admin_password_hash: "$argon2id$v=19$stub"
  anonymous_read: false
  rate_limit:
    max_failures: 5

database:
  path: "/tmp/test.db"

storage:
  default_backend: "local"
  backends:
    local:
      type: filesystem
      root: "/srv/artifacts"
    scratch:
      type: memory

cache:
  retention_secs: 600
  max_entries: 50
  sweep_interval_secs: 30

upstream:
  connect_timeout_secs: 3
  retry:
    max_retries: 0

container:
  port_range_start: 6000
  port_range_end: 6010
  service_name: "depot"
  signing_key: "k3y"
  upload_idle_secs: 120
  max_blob_bytes: 1048576

logging:
  level: "debug"
  format: "pretty"
"#;

        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.base_url(), "https://depot.example.com");

        assert!(config.auth.enabled);
        assert!(!config.auth.anonymous_read);
        assert_eq!(config.auth.rate_limit.max_failures, 5);

        assert_eq!(config.database.path, "/tmp/test.db");

        assert_eq!(config.storage.default_backend, "local");
        assert_eq!(
            config.storage.backends.get("local"),
            Some(&StorageBackendConfig::Filesystem {
                root: "/srv/artifacts".to_string()
            })
        );
        assert_eq!(
            config.storage.backends.get("scratch"),
            Some(&StorageBackendConfig::Memory)
        );

        assert_eq!(config.cache.retention_secs, 600);
        assert_eq!(config.cache.max_entries, 50);
        assert_eq!(config.upstream.connect_timeout_secs, 3);
        assert_eq!(config.upstream.retry.max_retries, 0);

        assert_eq!(config.container.port_range_start, 6000);
        assert_eq!(config.container.service_name, "depot");
        assert_eq!(config.container.signing_key, Some("k3y".to_string()));
        assert_eq!(config.container.upload_idle_secs, 120);
        assert_eq!(config.container.max_blob_bytes, 1048576);

        assert_eq!(config.logging.format, "pretty");
    }

    // Test 2: Default values are applied for missing fields
    #[test]
    fn test_default_values_applied() {
        let config = Config::from_yaml("server:\n  port: 3000\n").unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.base_url(), "http://0.0.0.0:3000");
        assert!(config.auth.enabled);
        assert!(config.auth.anonymous_read);
        assert_eq!(config.storage.default_backend, "default");
        assert_eq!(config.cache.default_ttl_secs, 3600);
        assert_eq!(config.upstream.retry.max_retries, 2);
        assert_eq!(config.container.port_range_start, 5000);
        assert_eq!(config.container.port_range_end, 5099);
        assert_eq!(config.container.token_ttl_secs, 300);
        assert_eq!(config.container.upload_idle_secs, 3600);
        assert_eq!(config.container.max_blob_bytes, 2 * 1024 * 1024 * 1024);
        assert!(!config.otel.enabled);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "json");
    }

    // Test 3: Environment variable expansion
    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_DEPOT_SIGNING_KEY", "from-env");
        std::env::set_var("TEST_DEPOT_DB_PATH", "/var/data/depot.db");

        let yaml = r#"
container:
  signing_key: "${TEST_DEPOT_SIGNING_KEY}"
database:
  path: "${TEST_DEPOT_DB_PATH}"
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.container.signing_key, Some("from-env".to_string()));
        assert_eq!(config.database.path, "/var/data/depot.db");

        std::env::remove_var("TEST_DEPOT_SIGNING_KEY");
        std::env::remove_var("TEST_DEPOT_DB_PATH");
    }

    // Test 4: from_env loads config from environment variables
    #[test]
    fn test_from_env() {
        std::env::set_var("ARTIFACT_DEPOT_SERVER_HOST", "localhost");
        std::env::set_var("ARTIFACT_DEPOT_SERVER_PORT", "9999");
        std::env::set_var("ARTIFACT_DEPOT_STORAGE_ROOT", "/env/artifacts");
        std::env::set_var("ARTIFACT_DEPOT_AUTH_ENABLED", "false");

        let config = Config::from_env().unwrap();

        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.server.port, 9999);
        assert!(!config.auth.enabled);
        assert_eq!(
            config.storage.backends.get("default"),
            Some(&StorageBackendConfig::Filesystem {
                root: "/env/artifacts".to_string()
            })
        );

        std::env::remove_var("ARTIFACT_DEPOT_SERVER_HOST");
        std::env::remove_var("ARTIFACT_DEPOT_SERVER_PORT");
        std::env::remove_var("ARTIFACT_DEPOT_STORAGE_ROOT");
        std::env::remove_var("ARTIFACT_DEPOT_AUTH_ENABLED");
    }

    // Test 5: Parse error for invalid YAML
    #[test]
    fn test_parse_error_invalid_yaml() {
        let result = Config::from_yaml("server:\n  port: \"not_a_number\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    // Test 6: Inverted port range is rejected
    #[test]
    fn test_invalid_port_range() {
        let yaml = r#"
container:
  port_range_start: 6000
  port_range_end: 5000
"#;
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    // Test 7: Default backend must exist
    #[test]
    fn test_missing_default_backend() {
        let yaml = r#"
storage:
  default_backend: "nowhere"
"#;
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    // Test 8: Serialization round trip keeps backend tags
    #[test]
    fn test_config_serialization_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config, parsed);
    }
}

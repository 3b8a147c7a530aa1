//! Configuration management for the Skybridge hub
//!
//! Settings are loaded from:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct for the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkybridgeConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Filesystem layout
    pub paths: PathsConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Block server supervision
    pub block_server: BlockServerConfig,
    /// Remote Node access over the reverse tunnel
    pub node: NodeConfig,
    /// CloudStack endpoint and credentials
    pub cloudstack: CloudStackConfig,
    /// Volume Daemon endpoint
    pub volume_daemon: VolumeDaemonConfig,
    /// Restore mount handling
    pub restore: RestoreConfig,
    /// Scheduler behavior
    pub scheduler: SchedulerConfig,
    /// Node enrollment and tunnel trust
    pub enrollment: EnrollmentConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for hub data
    pub data_dir: PathBuf,
    /// Default directory for local backup repositories
    pub repositories: PathBuf,
    /// Directory for restore mount points
    pub restore_mounts: PathBuf,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite:///var/lib/skybridge/skybridge.db")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Block server supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockServerConfig {
    /// Binary launched per exported backup file
    pub binary: String,
    /// Lowest port handed out by the allocator
    pub port_low: u16,
    /// Highest port handed out by the allocator (inclusive)
    pub port_high: u16,
    /// Address Nodes use to reach exported targets
    pub advertise_host: String,
}

/// Remote Node access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local port the reverse tunnel forwards to the Node API
    pub tunnel_port: u16,
    /// Request timeout in seconds for Node calls
    pub request_timeout_secs: u64,
    /// Transient-transport retry attempts for Node calls
    pub retry_attempts: u32,
}

/// CloudStack endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudStackConfig {
    /// API endpoint, e.g. "http://cloudstack:8080/client/api"
    pub api_url: String,
    /// API key
    pub api_key: String,
    /// Secret key used for request signing
    pub secret_key: String,
    /// Destination VM that holds replicated volumes between failovers
    pub appliance_vm_id: String,
    /// Async job timeout for create operations, seconds
    pub create_timeout_secs: u64,
    /// Async job timeout for delete operations, seconds
    pub delete_timeout_secs: u64,
    /// Async job timeout for power operations, seconds
    pub power_timeout_secs: u64,
}

/// Volume Daemon endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDaemonConfig {
    /// Base URL of the Volume Daemon API
    pub api_url: String,
    /// Default operation await timeout, seconds
    pub operation_timeout_secs: u64,
}

/// Restore mount handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Idle TTL after which a mount is scavenged, seconds
    pub mount_idle_ttl_secs: u64,
    /// Scavenger sweep interval, seconds
    pub cleanup_interval_secs: u64,
    /// Number of NBD devices available for restore mounts
    pub nbd_device_count: u8,
}

/// Scheduler behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone name used to evaluate cron expressions
    pub timezone: String,
    /// Evaluation tick interval, seconds
    pub tick_interval_secs: u64,
}

/// Node enrollment and tunnel trust
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentConfig {
    /// Pairing code time-to-live, seconds
    pub pairing_code_ttl_secs: u64,
    /// Authorized keys file for the tunnel user
    pub authorized_keys_path: PathBuf,
    /// Tunnel account the Nodes connect as
    pub tunnel_user: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Enable file logging
    pub file_logging_enabled: bool,
}

impl Default for SkybridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            paths: PathsConfig::default(),
            database: DatabaseConfig::default(),
            block_server: BlockServerConfig::default(),
            node: NodeConfig::default(),
            cloudstack: CloudStackConfig::default(),
            volume_daemon: VolumeDaemonConfig::default(),
            restore: RestoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            enrollment: EnrollmentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8082,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("/var/lib/skybridge");
        Self {
            repositories: data_dir.join("repositories"),
            restore_mounts: data_dir.join("restore"),
            data_dir,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:///var/lib/skybridge/skybridge.db".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for BlockServerConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-nbd".to_string(),
            port_low: 10100,
            port_high: 10200,
            advertise_host: "127.0.0.1".to_string(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tunnel_port: 9081,
            request_timeout_secs: 30,
            retry_attempts: 3,
        }
    }
}

impl Default for CloudStackConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/client/api".to_string(),
            api_key: String::new(),
            secret_key: String::new(),
            appliance_vm_id: String::new(),
            create_timeout_secs: 300,
            delete_timeout_secs: 180,
            power_timeout_secs: 120,
        }
    }
}

impl Default for VolumeDaemonConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8090/api/v1".to_string(),
            operation_timeout_secs: 300,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            mount_idle_ttl_secs: 3600,
            cleanup_interval_secs: 300,
            nbd_device_count: 8,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            tick_interval_secs: 30,
        }
    }
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            pairing_code_ttl_secs: 600,
            authorized_keys_path: PathBuf::from("/home/skybridge-tunnel/.ssh/authorized_keys"),
            tunnel_user: "skybridge-tunnel".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("/var/log/skybridge"),
            file_logging_enabled: false,
        }
    }
}

impl SkybridgeConfig {
    /// Load configuration from environment variables and optional config file
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(config_path) = Self::find_config_file() {
            if let Ok(file_config) = Self::load_from_file(&config_path) {
                config = file_config;
            }
        }

        config.apply_env_overrides();

        config
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("SKYBRIDGE_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/skybridge/config.toml")),
            Some(PathBuf::from("./config.toml")),
            Some(PathBuf::from("./skybridge.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Server
        if let Ok(host) = std::env::var("SKYBRIDGE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SKYBRIDGE_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        // Paths
        if let Ok(data_dir) = std::env::var("SKYBRIDGE_DATA_DIR") {
            let data_dir = PathBuf::from(data_dir);
            self.paths.repositories = data_dir.join("repositories");
            self.paths.restore_mounts = data_dir.join("restore");
            self.paths.data_dir = data_dir;
        }

        // Database
        if let Ok(url) = std::env::var("SKYBRIDGE_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(max) = std::env::var("SKYBRIDGE_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                self.database.max_connections = max;
            }
        }

        // Block server
        if let Ok(binary) = std::env::var("SKYBRIDGE_BLOCK_SERVER_BINARY") {
            self.block_server.binary = binary;
        }
        if let Ok(low) = std::env::var("SKYBRIDGE_PORT_LOW") {
            if let Ok(low) = low.parse() {
                self.block_server.port_low = low;
            }
        }
        if let Ok(high) = std::env::var("SKYBRIDGE_PORT_HIGH") {
            if let Ok(high) = high.parse() {
                self.block_server.port_high = high;
            }
        }

        // Node tunnel
        if let Ok(port) = std::env::var("SKYBRIDGE_TUNNEL_PORT") {
            if let Ok(port) = port.parse() {
                self.node.tunnel_port = port;
            }
        }

        // CloudStack
        if let Ok(url) = std::env::var("SKYBRIDGE_CLOUDSTACK_URL") {
            self.cloudstack.api_url = url;
        }
        if let Ok(key) = std::env::var("SKYBRIDGE_CLOUDSTACK_API_KEY") {
            self.cloudstack.api_key = key;
        }
        if let Ok(secret) = std::env::var("SKYBRIDGE_CLOUDSTACK_SECRET_KEY") {
            self.cloudstack.secret_key = secret;
        }
        if let Ok(vm_id) = std::env::var("SKYBRIDGE_APPLIANCE_VM_ID") {
            self.cloudstack.appliance_vm_id = vm_id;
        }

        // Volume Daemon
        if let Ok(url) = std::env::var("SKYBRIDGE_VOLUME_DAEMON_URL") {
            self.volume_daemon.api_url = url;
        }

        // Restore
        if let Ok(ttl) = std::env::var("SKYBRIDGE_RESTORE_MOUNT_TTL") {
            if let Ok(ttl) = ttl.parse() {
                self.restore.mount_idle_ttl_secs = ttl;
            }
        }

        // Scheduler
        if let Ok(tz) = std::env::var("SKYBRIDGE_SCHEDULER_TIMEZONE") {
            self.scheduler.timezone = tz;
        }

        // Enrollment
        if let Ok(path) = std::env::var("SKYBRIDGE_AUTHORIZED_KEYS") {
            self.enrollment.authorized_keys_path = PathBuf::from(path);
        }
        if let Ok(user) = std::env::var("SKYBRIDGE_TUNNEL_USER") {
            self.enrollment.tunnel_user = user;
        }

        // Logging
        if let Ok(level) = std::env::var("SKYBRIDGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(path) = std::env::var("SKYBRIDGE_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(path);
        }
        if let Ok(enabled) = std::env::var("SKYBRIDGE_FILE_LOGGING") {
            self.logging.file_logging_enabled = enabled.parse().unwrap_or(false);
        }
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("Port cannot be 0".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(ConfigError::Validation(
                "Database URL cannot be empty".to_string(),
            ));
        }

        if self.block_server.port_low > self.block_server.port_high {
            return Err(ConfigError::Validation(format!(
                "Block server port range [{}, {}] is inverted",
                self.block_server.port_low, self.block_server.port_high
            )));
        }

        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Unknown scheduler timezone '{}'",
                self.scheduler.timezone
            )));
        }

        if url::Url::parse(&self.cloudstack.api_url).is_err() {
            return Err(ConfigError::Validation(format!(
                "CloudStack API URL '{}' is not a valid URL",
                self.cloudstack.api_url
            )));
        }
        if url::Url::parse(&self.volume_daemon.api_url).is_err() {
            return Err(ConfigError::Validation(format!(
                "Volume Daemon URL '{}' is not a valid URL",
                self.volume_daemon.api_url
            )));
        }

        Ok(())
    }

    /// Parsed scheduler timezone; validate() guarantees this succeeds
    pub fn scheduler_timezone(&self) -> chrono_tz::Tz {
        self.scheduler
            .timezone
            .parse()
            .unwrap_or(chrono_tz::Tz::UTC)
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Failed to read configuration file
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    Parse(String),
    /// Configuration validation failed
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, err) => {
                write!(f, "Failed to read config file {:?}: {}", path, err)
            }
            ConfigError::Parse(err) => write!(f, "Failed to parse config: {}", err),
            ConfigError::Validation(err) => write!(f, "Config validation failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SkybridgeConfig::default();
        assert_eq!(config.server.port, 8082);
        assert_eq!(config.block_server.port_low, 10100);
        assert_eq!(config.block_server.port_high, 10200);
        assert_eq!(config.node.tunnel_port, 9081);
        assert_eq!(config.paths.data_dir, PathBuf::from("/var/lib/skybridge"));
    }

    #[test]
    fn test_config_validation() {
        let config = SkybridgeConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = SkybridgeConfig::default();
        invalid.server.port = 0;
        assert!(invalid.validate().is_err());

        let mut inverted = SkybridgeConfig::default();
        inverted.block_server.port_low = 10300;
        assert!(inverted.validate().is_err());

        let mut bad_tz = SkybridgeConfig::default();
        bad_tz.scheduler.timezone = "Mars/Olympus".to_string();
        assert!(bad_tz.validate().is_err());

        let mut bad_url = SkybridgeConfig::default();
        bad_url.cloudstack.api_url = "not a url".to_string();
        assert!(bad_url.validate().is_err());
    }

    #[test]
    fn test_generate_sample_config() {
        let sample = SkybridgeConfig::generate_sample();
        assert!(sample.contains("[server]"));
        assert!(sample.contains("[block_server]"));
        assert!(sample.contains("[cloudstack]"));
        assert!(sample.contains("[enrollment]"));
    }

    #[test]
    fn test_scheduler_timezone_parse() {
        let mut config = SkybridgeConfig::default();
        config.scheduler.timezone = "Europe/Berlin".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler_timezone(), chrono_tz::Europe::Berlin);
    }
}

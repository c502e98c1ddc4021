//! Configuration for corral-daemon

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use corral_broker::BrokerConfig;
use corral_enforce::EnforcementConfig;
use corral_supervisor::SupervisorConfig;
use serde::{Deserialize, Serialize};

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Liveness supervision
    #[serde(default)]
    pub supervisor: LivenessConfig,

    /// Claim broker
    #[serde(default)]
    pub broker: ClaimConfig,

    /// Host enforcement
    #[serde(default)]
    pub enforcement: EnforcementSettings,

    /// Host topology file, read once at startup
    #[serde(default = "default_topology_path")]
    pub topology_path: PathBuf,

    /// Root under which `/sys` knobs are resolved
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            supervisor: LivenessConfig::default(),
            broker: ClaimConfig::default(),
            enforcement: EnforcementSettings::default(),
            topology_path: default_topology_path(),
            sysfs_root: default_sysfs_root(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default)]
    pub enable_cors: bool,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            enable_cors: false,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Liveness supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Heartbeat silence after which a client is declared lost
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,

    /// Period of the liveness sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: default_liveness_timeout(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl LivenessConfig {
    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }
}

/// Claim broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimConfig {
    /// Retries after a commit-time conflict before giving up
    #[serde(default = "default_max_claim_retries")]
    pub max_claim_retries: u32,

    /// Finished assignments kept for inspection
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_claim_retries: default_max_claim_retries(),
            history_limit: default_history_limit(),
        }
    }
}

impl ClaimConfig {
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_claim_retries: self.max_claim_retries,
            history_limit: self.history_limit,
        }
    }
}

/// Host enforcement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementSettings {
    /// Upper bound on a single host call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Record directives in memory instead of applying them to the host
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for EnforcementSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            dry_run: false,
        }
    }
}

impl EnforcementSettings {
    pub fn to_engine_config(&self) -> EnforcementConfig {
        EnforcementConfig {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7420))
}

fn default_request_timeout() -> u64 {
    10
}

fn default_liveness_timeout() -> u64 {
    5_000
}

fn default_sweep_interval() -> u64 {
    500
}

fn default_max_claim_retries() -> u32 {
    3
}

fn default_history_limit() -> usize {
    1024
}

fn default_call_timeout() -> u64 {
    2_000
}

fn default_topology_path() -> PathBuf {
    PathBuf::from("/etc/corral/topology.yaml")
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `CORRAL_`-prefixed environment variables.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CORRAL_SUPERVISOR__LIVENESS_TIMEOUT_MS=3000`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CORRAL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Configuration for running without privilege against an in-memory host.
    pub fn dry_run() -> Self {
        Self {
            enforcement: EnforcementSettings {
                dry_run: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.listen_addr.port(), 7420);
        assert!(config.server.listen_addr.ip().is_loopback());
        assert!(!config.enforcement.dry_run);
        assert_eq!(config.topology_path, PathBuf::from("/etc/corral/topology.yaml"));
    }

    #[test]
    fn test_section_conversions() {
        let config = DaemonConfig::default();

        let supervisor = config.supervisor.to_supervisor_config();
        assert_eq!(supervisor.liveness_timeout, Duration::from_secs(5));
        assert_eq!(supervisor.sweep_interval, Duration::from_millis(500));

        let broker = config.broker.to_broker_config();
        assert_eq!(broker.max_claim_retries, 3);
        assert_eq!(broker.history_limit, 1024);

        let engine = config.enforcement.to_engine_config();
        assert_eq!(engine.call_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
topology_path = "/tmp/topology.yaml"

[supervisor]
liveness_timeout_ms = 1500

[enforcement]
dry_run = true
"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.topology_path, PathBuf::from("/tmp/topology.yaml"));
        assert_eq!(config.supervisor.liveness_timeout_ms, 1500);
        assert_eq!(config.supervisor.sweep_interval_ms, 500);
        assert!(config.enforcement.dry_run);
        assert_eq!(config.broker.max_claim_retries, 3);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = DaemonConfig::load(Some("/nonexistent/corral")).unwrap();
        assert_eq!(config.server.request_timeout_secs, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_dry_run_config() {
        let config = DaemonConfig::dry_run();
        assert!(config.enforcement.dry_run);
        assert_eq!(config.enforcement.call_timeout_ms, 2_000);
    }
}

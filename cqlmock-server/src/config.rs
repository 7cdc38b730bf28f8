//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CQLMOCK_CONFIG or --config)
//! 3. Environment variables

use cqlmock_protocol::{
    DEFAULT_PORT, HIGHEST_SUPPORTED_VERSION, LOWEST_SUPPORTED_VERSION, MAX_BODY_SIZE,
};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|value| value == "1" || value.to_lowercase() == "true")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Accepted protocol versions.
    pub protocol: ProtocolConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CQLMOCK_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.protocol.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.protocol.validate()?;
        self.auth.validate()?;
        self.tls.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address of the first node. Further nodes take the following IPv4
    /// addresses on the same port.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Number of nodes in the cluster.
    pub nodes: usize,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections per node.
    pub max_connections: usize,
    /// Close every connection as soon as it is accepted.
    pub close_immediately: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            nodes: 1,
            idle_timeout_secs: 300,
            max_connections: 1000,
            close_immediately: false,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parse("CQLMOCK_BIND") {
            self.bind_addr = addr;
        }
        if let Some(nodes) = env_parse("CQLMOCK_NODES") {
            self.nodes = nodes;
        }
        if let Some(secs) = env_parse("CQLMOCK_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(max) = env_parse("CQLMOCK_MAX_CONNECTIONS") {
            self.max_connections = max;
        }
        if let Some(close) = env_flag("CQLMOCK_CLOSE_IMMEDIATELY") {
            self.close_immediately = close;
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes == 0 {
            return Err(ConfigError::ValidationError(
                "network.nodes must be at least 1".to_string(),
            ));
        }
        if self.nodes > 1 && !self.bind_addr.is_ipv4() {
            return Err(ConfigError::ValidationError(
                "multi-node clusters need an IPv4 bind address".to_string(),
            ));
        }
        Ok(())
    }
}

/// Range of protocol versions the nodes accept, and the frame size limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub lowest_version: u8,
    pub highest_version: u8,
    /// Longest frame body in bytes. Larger frames get PROTOCOL_ERROR and
    /// the connection is closed.
    pub max_body_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            lowest_version: LOWEST_SUPPORTED_VERSION,
            highest_version: HIGHEST_SUPPORTED_VERSION,
            max_body_size: MAX_BODY_SIZE,
        }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("CQLMOCK_LOWEST_VERSION") {
            self.lowest_version = v;
        }
        if let Some(v) = env_parse("CQLMOCK_HIGHEST_VERSION") {
            self.highest_version = v;
        }
        if let Some(size) = env_parse("CQLMOCK_MAX_BODY_SIZE") {
            self.max_body_size = size;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let supported = LOWEST_SUPPORTED_VERSION..=HIGHEST_SUPPORTED_VERSION;
        if !supported.contains(&self.lowest_version) || !supported.contains(&self.highest_version) {
            return Err(ConfigError::ValidationError(format!(
                "protocol versions must be within {}..={}",
                LOWEST_SUPPORTED_VERSION, HIGHEST_SUPPORTED_VERSION
            )));
        }
        if self.lowest_version > self.highest_version {
            return Err(ConfigError::ValidationError(format!(
                "lowest_version {} is above highest_version {}",
                self.lowest_version, self.highest_version
            )));
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_body_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require PLAIN authentication after STARTUP.
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("CQLMOCK_AUTH_ENABLED") {
            self.enabled = enabled;
        }
        if let Ok(username) = std::env::var("CQLMOCK_AUTH_USERNAME") {
            self.username = username;
        }
        if let Ok(password) = std::env::var("CQLMOCK_AUTH_PASSWORD") {
            self.password = password;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.username.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth enabled but username not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS.
    #[serde(default)]
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    #[serde(default)]
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    /// Required if require_client_cert is true.
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("CQLMOCK_TLS_ENABLED") {
            self.enabled = enabled;
        }
        if let Ok(path) = std::env::var("CQLMOCK_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("CQLMOCK_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Some(require) = env_flag("CQLMOCK_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = require;
        }
        if let Ok(path) = std::env::var("CQLMOCK_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("CQLMOCK_METRICS_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(addr) = env_parse("CQLMOCK_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 9042);
        assert_eq!(config.network.nodes, 1);
        assert_eq!(config.protocol.lowest_version, 1);
        assert_eq!(config.protocol.highest_version, 5);
        assert!(!config.auth.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.metrics.bind_addr, config.metrics.bind_addr);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"127.0.0.1:19042\"\n  nodes: 3\nprotocol:\n  highest_version: 4\nauth:\n  enabled: true\n  username: cassandra\n  password: cassandra"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 19042);
        assert_eq!(config.network.nodes, 3);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.protocol.lowest_version, 1);
        assert_eq!(config.protocol.highest_version, 4);
        assert_eq!(config.protocol.max_body_size, MAX_BODY_SIZE);
        assert!(config.auth.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_errors() {
        let err = Config::from_file("/nonexistent/cqlmock.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "network: [").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.network.nodes = 2;
        config.save(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap().network.nodes, 2);
    }

    #[test]
    fn test_protocol_validation() {
        let mut protocol = ProtocolConfig::default();
        protocol.lowest_version = 4;
        protocol.highest_version = 3;
        assert!(protocol.validate().is_err());

        protocol.lowest_version = 0;
        protocol.highest_version = 5;
        assert!(protocol.validate().is_err());

        protocol.lowest_version = 3;
        protocol.highest_version = 4;
        assert!(protocol.validate().is_ok());

        protocol.max_body_size = 0;
        assert!(protocol.validate().is_err());
    }

    #[test]
    fn test_network_validation() {
        let mut network = NetworkConfig::default();
        network.nodes = 0;
        assert!(network.validate().is_err());

        network.nodes = 2;
        network.bind_addr = "[::1]:9042".parse().unwrap();
        assert!(network.validate().is_err());
    }

    #[test]
    fn test_tls_validation() {
        let mut tls = TlsConfig::default();
        assert!(tls.validate().is_ok());

        tls.enabled = true;
        let err = tls.validate().unwrap_err();
        assert!(err.to_string().contains("cert_path"));

        tls.cert_path = Some("cert.pem".into());
        tls.key_path = Some("key.pem".into());
        tls.require_client_cert = true;
        let err = tls.validate().unwrap_err();
        assert!(err.to_string().contains("client_ca_path"));
    }

    #[test]
    fn test_auth_validation() {
        let auth = AuthConfig {
            enabled: true,
            username: String::new(),
            password: "p".into(),
        };
        assert!(auth.validate().is_err());
    }
}

//! Configuration module for the sampler server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::gateway::Topology;
use crate::protocol::TrailingPolicy;

/// Command-line arguments for the sampler server
#[derive(Parser, Debug, Default)]
#[command(name = "asic-sampler")]
#[command(author = "asic-sampler authors")]
#[command(version = "0.1.0")]
#[command(about = "Serves seed-driven hash searches from ASIC hardware", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:4028)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Search backend (software, mock)
    #[arg(short = 'b', long)]
    pub backend: Option<BackendType>,

    /// Deadline for each hardware result, in milliseconds
    #[arg(long)]
    pub collect_timeout_ms: Option<u64>,

    /// What to do with bytes after the request (reject, ignore)
    #[arg(long)]
    pub trailing_data: Option<TrailingPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Search backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Double SHA-256 search on the CPU
    #[default]
    Software,
    /// Fixed replay of the firmware stub result
    Mock,
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "software" => Ok(BackendType::Software),
            "mock" => Ok(BackendType::Mock),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Wire protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub trailing_data: TrailingPolicy,
    /// Deadline for receiving the full request
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            trailing_data: TrailingPolicy::default(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

/// Search hardware configuration
#[derive(Debug, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub backend: BackendType,
    #[serde(default = "default_chains")]
    pub chains: u32,
    #[serde(default = "default_chips_per_chain")]
    pub chips_per_chain: u32,
    /// Deadline for each result from an in-flight search
    #[serde(default = "default_collect_timeout_ms")]
    pub collect_timeout_ms: u64,
    /// Nonces scanned per request by the software backend
    #[serde(default = "default_nonce_limit")]
    pub nonce_limit: u64,
    /// Matches reported per request by the software backend
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            chains: default_chains(),
            chips_per_chain: default_chips_per_chain(),
            collect_timeout_ms: default_collect_timeout_ms(),
            nonce_limit: default_nonce_limit(),
            max_results: default_max_results(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:4028".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_chains() -> u32 {
    3
}

fn default_chips_per_chain() -> u32 {
    63
}

fn default_collect_timeout_ms() -> u64 {
    30_000
}

fn default_nonce_limit() -> u64 {
    1 << 20
}

fn default_max_results() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub trailing_data: TrailingPolicy,
    pub read_timeout: Duration,
    pub backend: BackendType,
    pub topology: Topology,
    pub collect_timeout: Duration,
    pub nonce_limit: u64,
    pub max_results: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            protocol,
            hardware,
            logging,
        } = toml_config;

        Config {
            listen: cli.listen.unwrap_or(server.listen),
            workers: cli.workers.or(server.workers),
            max_connections: server.max_connections,
            trailing_data: cli.trailing_data.unwrap_or(protocol.trailing_data),
            read_timeout: Duration::from_millis(protocol.read_timeout_ms),
            backend: cli.backend.unwrap_or(hardware.backend),
            topology: Topology {
                chains: hardware.chains,
                chips_per_chain: hardware.chips_per_chain,
            },
            collect_timeout: Duration::from_millis(
                cli.collect_timeout_ms.unwrap_or(hardware.collect_timeout_ms),
            ),
            nonce_limit: hardware.nonce_limit,
            max_results: hardware.max_results,
            log_level: cli.log_level.unwrap_or(logging.level),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.units() == 0 {
            return Err(ConfigError::Invalid(
                "hardware.chains and hardware.chips_per_chain must be greater than 0".into(),
            ));
        }
        if self.collect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "hardware.collect_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "protocol.read_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.nonce_limit == 0 {
            return Err(ConfigError::Invalid(
                "hardware.nonce_limit must be greater than 0".into(),
            ));
        }
        if self.max_results == 0 {
            return Err(ConfigError::Invalid(
                "hardware.max_results must be greater than 0".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be greater than 0".into(),
            ));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::merge(CliArgs::default(), TomlConfig::default());
        assert_eq!(config.listen, "0.0.0.0:4028");
        assert_eq!(config.backend, BackendType::Software);
        assert_eq!(config.trailing_data, TrailingPolicy::Reject);
        assert_eq!(config.topology.units(), 189);
        assert_eq!(config.collect_timeout, Duration::from_secs(30));
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:14028"
            workers = 2
            max_connections = 16

            [protocol]
            trailing_data = "ignore"
            read_timeout_ms = 250

            [hardware]
            backend = "mock"
            chains = 1
            chips_per_chain = 4
            collect_timeout_ms = 1000
            nonce_limit = 65536
            max_results = 8

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(CliArgs::default(), toml_config);

        assert_eq!(config.listen, "127.0.0.1:14028");
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.trailing_data, TrailingPolicy::Ignore);
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.backend, BackendType::Mock);
        assert_eq!(
            config.topology,
            Topology {
                chains: 1,
                chips_per_chain: 4
            }
        );
        assert_eq!(config.collect_timeout, Duration::from_secs(1));
        assert_eq!(config.nonce_limit, 65536);
        assert_eq!(config.max_results, 8);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:1"
            [hardware]
            backend = "software"
            collect_timeout_ms = 10
        "#,
        )
        .unwrap();

        let cli = CliArgs::parse_from([
            "asic-sampler",
            "--listen",
            "127.0.0.1:2",
            "--backend",
            "mock",
            "--collect-timeout-ms",
            "20",
            "--trailing-data",
            "ignore",
            "--log-level",
            "trace",
        ]);
        let config = Config::merge(cli, toml_config);

        assert_eq!(config.listen, "127.0.0.1:2");
        assert_eq!(config.backend, BackendType::Mock);
        assert_eq!(config.collect_timeout, Duration::from_millis(20));
        assert_eq!(config.trailing_data, TrailingPolicy::Ignore);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(toml::from_str::<TomlConfig>("[hardware]\nbackend = \"fpga\"").is_err());
        assert!(CliArgs::try_parse_from(["asic-sampler", "--backend", "fpga"]).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::merge(CliArgs::default(), TomlConfig::default());
        config.topology.chips_per_chain = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::merge(CliArgs::default(), TomlConfig::default());
        config.collect_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::merge(CliArgs::default(), TomlConfig::default());
        config.nonce_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::merge(CliArgs::default(), TomlConfig::default());
        config.workers = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_errors_name_the_path() {
        let path = PathBuf::from("/etc/asic-sampler/missing.toml");

        let read = ConfigError::FileRead(
            path.clone(),
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        assert_eq!(
            read.to_string(),
            "Failed to read config file '/etc/asic-sampler/missing.toml': no such file"
        );

        let parse_error = toml::from_str::<TomlConfig>("[server").unwrap_err();
        let parse = ConfigError::TomlParse(path, parse_error);
        assert!(parse
            .to_string()
            .starts_with("Failed to parse config file '/etc/asic-sampler/missing.toml': "));
    }
}

//! Configuration for the router and the `socket-router` binary.
//!
//! The library only needs [`RouterConfig`]. The binary resolves a [`Config`]
//! from command-line arguments and an optional TOML file; CLI arguments take
//! precedence over config file values.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::reclaim::DEFAULT_PORT_FREE_TIMEOUT;
use crate::router::parse_port;

/// Settings for a [`Router`](crate::Router).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Interface the listener binds to.
    pub host: IpAddr,
    /// Largest accepted inbound frame payload, in bytes.
    pub max_frame_size: usize,
    /// Bound on the force-listen port reclamation.
    pub port_free_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            port_free_timeout: DEFAULT_PORT_FREE_TIMEOUT,
        }
    }
}

/// Command-line arguments for the router binary
#[derive(Parser, Debug)]
#[command(name = "socket-router")]
#[command(version)]
#[command(about = "A JSON message router over TCP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<String>,

    /// Terminate whatever process holds the port before binding
    #[arg(short, long)]
    pub force: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_port_free_timeout_ms")]
    pub port_free_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            force: false,
            max_frame_size: default_max_frame_size(),
            port_free_timeout_ms: default_port_free_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    4444
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_port_free_timeout_ms() -> u64 {
    DEFAULT_PORT_FREE_TIMEOUT.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub force: bool,
    pub max_frame_size: usize,
    pub port_free_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over a TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = match cli.port {
            Some(ref raw) => parse_port(raw).map_err(|_| ConfigError::InvalidPort(raw.clone()))?,
            None => toml_config.server.port,
        };

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            force: cli.force || toml_config.server.force,
            max_frame_size: toml_config.server.max_frame_size,
            port_free_timeout: Duration::from_millis(toml_config.server.port_free_timeout_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Library-level settings for the router.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            host: self.host,
            max_frame_size: self.max_frame_size,
            port_free_timeout: self.port_free_timeout,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid port {0:?}")]
    InvalidPort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("socket-router").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.server.port, 4444);
        assert!(!config.server.force);
        assert_eq!(config.server.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 4445
            force = true
            max_frame_size = 1024
            port_free_timeout_ms = 250

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.server.port, 4445);
        assert!(config.server.force);
        assert_eq!(config.server.max_frame_size, 1024);
        assert_eq!(config.server.port_free_timeout_ms, 250);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 5000
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(cli(&["--port", "6000", "--log-level", "trace"]), toml_config)
            .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_toml_used_when_cli_silent() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 5000
            force = true
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(cli(&[]), toml_config).unwrap();
        assert_eq!(config.port, 5000);
        assert!(config.force);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.router_config().max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_invalid_cli_port() {
        for bad in ["bad_port", "0", "70000"] {
            let result = Config::merge(cli(&["--port", bad]), TomlConfig::default());
            assert!(matches!(result, Err(ConfigError::InvalidPort(_))), "{bad}");
        }
    }
}

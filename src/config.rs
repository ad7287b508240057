//! Configuration module for hello-ring.
//!
//! The only required input is the TCP port. Everything else has a default
//! and may be overridden from an optional TOML file or from CLI flags.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound accepted for the submission queue depth.
const MAX_QUEUE_DEPTH: u32 = 32768;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "hello-ring")]
#[command(author = "hello-ring authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Serves a fixed HTTP response from a single completion-queue event loop",
    long_about = None
)]
pub struct CliArgs {
    /// TCP port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Completion queue backend
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Number of submission queue entries
    #[arg(short = 'q', long)]
    pub queue_depth: Option<u32>,

    /// Listen backlog for pending connections
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Close connections whose read does not complete within this many
    /// milliseconds (0 or absent = wait forever)
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Which completion queue implementation drives the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Linux io_uring.
    Uring,
    /// Completions emulated on top of mio readiness polling.
    Mio,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Backend::Uring
        } else {
            Backend::Mio
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// How long shutdown waits for in-flight operations, in milliseconds
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            backlog: default_backlog(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Completion queue configuration
#[derive(Debug, Deserialize)]
pub struct QueueConfig {
    /// Submission queue entries
    #[serde(default = "default_queue_depth")]
    pub depth: u32,
    /// Backend selection
    #[serde(default)]
    pub backend: Backend,
    /// Read deadline in milliseconds, 0 disables it
    #[serde(default)]
    pub idle_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: default_queue_depth(),
            backend: Backend::default(),
            idle_timeout_ms: 0,
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> i32 {
    32
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_queue_depth() -> u32 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub queue_depth: u32,
    pub backlog: i32,
    pub idle_timeout: Option<Duration>,
    pub drain_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let idle_timeout_ms = cli
            .idle_timeout_ms
            .unwrap_or(toml_config.queue.idle_timeout_ms);

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port,
            backend: cli.backend.unwrap_or(toml_config.queue.backend),
            queue_depth: cli.queue_depth.unwrap_or(toml_config.queue.depth),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            idle_timeout: (idle_timeout_ms > 0).then(|| Duration::from_millis(idle_timeout_ms)),
            drain_timeout: Duration::from_millis(toml_config.server.drain_timeout_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "queue depth must be between 1 and {}, got {}",
                MAX_QUEUE_DEPTH, self.queue_depth
            )));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid(format!(
                "backlog must be positive, got {}",
                self.backlog
            )));
        }
        self.addr().map(|_| ())
    }

    /// Socket address to listen on.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid host address '{}'", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("hello-ring").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.backlog, 32);
        assert_eq!(config.server.drain_timeout_ms, 5000);
        assert_eq!(config.queue.depth, 1024);
        assert_eq!(config.queue.idle_timeout_ms, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_port_only() {
        let config = Config::from_cli(parse(&["8080"]).unwrap()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.backend, Backend::default());
        assert_eq!(config.queue_depth, 1024);
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.addr().unwrap(), "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn test_port_required_and_positive() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["0"]).is_err());
        assert!(parse(&["-5"]).is_err());
        assert!(parse(&["http"]).is_err());
        assert!(parse(&["70000"]).is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = parse(&[
            "9000",
            "--backend",
            "mio",
            "-q",
            "64",
            "--idle-timeout-ms",
            "250",
            "--host",
            "127.0.0.1",
        ])
        .unwrap();
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.backend, Backend::Mio);
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cli = parse(&["9000", "-q", "0"]).unwrap();
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::Invalid(_))));

        let cli = parse(&["9000", "--host", "not-an-ip"]).unwrap();
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            backlog = 128
            drain_timeout_ms = 250

            [queue]
            depth = 256
            backend = "mio"
            idle_timeout_ms = 5000

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.drain_timeout_ms, 250);
        assert_eq!(config.queue.depth, 256);
        assert_eq!(config.queue.backend, Backend::Mio);
        assert_eq!(config.queue.idle_timeout_ms, 5000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = std::env::temp_dir().join(format!("hello-ring-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[queue]\ndepth = 256\nbackend = \"mio\"\n[logging]\nlevel = \"warn\"\n",
        )
        .unwrap();

        let path_str = path.to_str().unwrap().to_string();
        let cli = parse(&["9000", "--config", &path_str, "-q", "512"]).unwrap();
        let config = Config::from_cli(cli).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.queue_depth, 512);
        assert_eq!(config.backend, Backend::Mio);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_missing_config_file() {
        let cli = parse(&["9000", "--config", "/nonexistent/hello-ring.toml"]).unwrap();
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }
}

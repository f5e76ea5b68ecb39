//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and an optional TOML configuration
//! file. CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "tcp-echo-server")]
#[command(author = "tcp-echo-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server that echoes back every byte it receives", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on (all interfaces)
    #[arg(value_name = "LISTEN_PORT")]
    pub port: u16,

    /// Verbosity. Can be used multiple times to further increase
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet. Do not print any log info. Overrides the verbosity flag
    #[arg(short, long)]
    pub quiet: bool,

    /// Announce "alive" every 5 seconds on each connection
    #[arg(short = 'a', long, alias = "announcealive")]
    pub announce_alive: bool,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub echo: EchoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Interface address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Pause after a failed accept, in milliseconds (0 = retry immediately)
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            accept_backoff_ms: default_accept_backoff_ms(),
        }
    }
}

/// Per-connection echo configuration
#[derive(Debug, Deserialize)]
pub struct EchoConfig {
    /// Write `alive\n` periodically on every connection
    #[serde(default)]
    pub announce_alive: bool,
    /// Seconds between alive announcements
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
    /// Upper bound on a single read before cancellation is re-checked
    #[serde(default = "default_read_deadline_ms")]
    pub read_deadline_ms: u64,
    /// Size of the per-connection echo buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            announce_alive: false,
            announce_interval_secs: default_announce_interval_secs(),
            read_deadline_ms: default_read_deadline_ms(),
            buffer_size: default_buffer_size(),
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

fn default_accept_backoff_ms() -> u64 {
    50
}

fn default_announce_interval_secs() -> u64 {
    5
}

fn default_read_deadline_ms() -> u64 {
    100
}

fn default_buffer_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Highest verbosity count that maps to a distinct level.
pub const MAX_VERBOSITY: u8 = 3;

/// Map the `-v` count and `-q` flag onto a filter directive.
///
/// Returns `None` when neither flag was given, so the config file decides.
pub fn level_from_flags(verbosity: u8, quiet: bool) -> Option<&'static str> {
    if quiet {
        return Some("off");
    }
    match verbosity {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub announce_alive: bool,
    pub announce_interval: Duration,
    pub read_deadline: Duration,
    pub buffer_size: usize,
    pub accept_backoff: Duration,
    pub log_level: String,
    /// Raw `-v` count, kept so an out-of-range value can be reported once
    /// logging is up.
    pub verbosity: u8,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::try_parse().map_err(ConfigError::Args)?;
        Self::from_cli(cli)
    }

    /// Resolve already-parsed CLI arguments against the optional TOML file.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge and reject values the server cannot run with.
    fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.announce_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "echo.announce_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.read_deadline.is_zero() {
            return Err(ConfigError::Invalid(
                "echo.read_deadline_ms must be greater than 0".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "echo.buffer_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let log_level = level_from_flags(cli.verbose, cli.quiet)
            .map(str::to_string)
            .unwrap_or(toml_config.logging.level);

        Config {
            host: toml_config.server.host,
            port: cli.port,
            announce_alive: cli.announce_alive || toml_config.echo.announce_alive,
            announce_interval: Duration::from_secs(toml_config.echo.announce_interval_secs),
            read_deadline: Duration::from_millis(toml_config.echo.read_deadline_ms),
            buffer_size: toml_config.echo.buffer_size,
            accept_backoff: Duration::from_millis(toml_config.server.accept_backoff_ms),
            log_level,
            verbosity: cli.verbose,
        }
    }

    /// The `host:port` string the listener binds to.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Args(clap::Error),
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Args(e) => write!(f, "{e}"),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

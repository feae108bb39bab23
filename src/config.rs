//! TOML configuration.
//!
//! One file drives every topology: the monolithic `run` command reads
//! `[log]`, `[output]`, `[db]` and `[server]`; the watcher (`watch`) reads
//! `[log]` and `[relay].bind`; the collector (`collect`) reads `[relay].url`
//! plus the persistence and server sections.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub start_from: StartFrom,
    #[serde(default)]
    pub strategy: ScanKind,
    /// Exit code used when the access log is missing at startup.
    #[serde(default)]
    pub missing_file_exit_code: i32,
}

impl LogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            poll_interval_ms: default_poll_interval_ms(),
            start_from: StartFrom::default(),
            strategy: ScanKind::default(),
            missing_file_exit_code: 0,
        }
    }
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/apache2/access_log")
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// Where the tailer starts counting on process start.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartFrom {
    /// Skip the lines already present at startup.
    #[default]
    End,
    /// Import the existing content on the first tick.
    Beginning,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    #[default]
    Rescan,
    Offset,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./files")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/registry.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
        }
    }
}

fn default_server_bind() -> String {
    "[::]:5000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Address the watcher listens on for collector connections.
    #[serde(default = "default_relay_bind")]
    pub bind: String,
    /// WebSocket URL the collector subscribes to.
    #[serde(default = "default_relay_url")]
    pub url: String,
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_relay_bind(),
            url: default_relay_url(),
            reconnect_secs: default_reconnect_secs(),
            capacity: default_capacity(),
        }
    }
}

fn default_relay_bind() -> String {
    "[::]:4000".to_string()
}
fn default_relay_url() -> String {
    "ws://localhost:4000/relay/new_line".to_string()
}
fn default_reconnect_secs() -> u64 {
    2
}
fn default_capacity() -> usize {
    1024
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.log.poll_interval_ms == 0 {
        anyhow::bail!("log.poll_interval_ms must be > 0");
    }

    if config.relay.capacity == 0 {
        anyhow::bail!("relay.capacity must be > 0");
    }

    if !(config.relay.url.starts_with("ws://") || config.relay.url.starts_with("wss://")) {
        anyhow::bail!(
            "relay.url must be a ws:// or wss:// URL, got '{}'",
            config.relay.url
        );
    }

    Ok(config)
}

//! Runtime configuration for the daemon.
//!
//! Read from `~/.histd/config.toml` (or `$HISTD_CONFIG`). Every section and
//! key is optional; a missing file yields the defaults.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".histd";
const CONFIG_ENV: &str = "HISTD_CONFIG";
const CONFIG_FILE_NAME: &str = "config.toml";
const HISTORY_FILE_NAME: &str = ".histd_history.json";
const SOCKET_NAME: &str = "histd.sock";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub writer: WriterSection,
    #[serde(default)]
    pub input: InputSection,
    #[serde(default)]
    pub strategy: StrategySection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonSection {
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistorySection {
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Capacity hint for the recency index at startup.
    #[serde(default = "default_init_size")]
    pub init_size: usize,
    /// Upper bound for the in-memory buffer of merged records. 0 disables
    /// the buffer.
    #[serde(default = "default_recent_records_limit")]
    pub recent_records_limit: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            path: None,
            init_size: default_init_size(),
            recent_records_limit: default_recent_records_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterSection {
    #[serde(default = "default_writer_workers")]
    pub workers: usize,
    #[serde(default = "default_writer_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WriterSection {
    fn default() -> Self {
        Self {
            workers: default_writer_workers(),
            queue_capacity: default_writer_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputSection {
    /// 0 means unbounded.
    #[serde(default = "default_input_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for InputSection {
    fn default() -> Self {
        Self {
            channel_capacity: default_input_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategySection {
    #[serde(default = "default_markov_order")]
    pub markov_order: usize,
    /// Newest records the strategies model; 0 keeps the whole history.
    #[serde(default = "default_strategy_history_limit")]
    pub history_limit: usize,
}

impl Default for StrategySection {
    fn default() -> Self {
        Self {
            markov_order: default_markov_order(),
            history_limit: default_strategy_history_limit(),
        }
    }
}

fn default_strategy_history_limit() -> usize {
    10_000
}

fn default_init_size() -> usize {
    100_000
}

fn default_recent_records_limit() -> usize {
    10_000
}

fn default_writer_workers() -> usize {
    2
}

fn default_writer_queue_capacity() -> usize {
    256
}

fn default_input_channel_capacity() -> usize {
    1024
}

fn default_markov_order() -> usize {
    1
}

impl DaemonConfig {
    pub fn history_path(&self, home: &Path) -> PathBuf {
        self.history
            .path
            .clone()
            .unwrap_or_else(|| home.join(HISTORY_FILE_NAME))
    }

    pub fn socket_path(&self, home: &Path) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(|| home.join(STATE_DIR).join(SOCKET_NAME))
    }
}

pub fn home_dir() -> Result<PathBuf, String> {
    dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())
}

pub fn default_config_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(home_dir()?.join(STATE_DIR).join(CONFIG_FILE_NAME))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read histd config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse histd config {}: {}",
            config_path.display(),
            err
        )
    })
}

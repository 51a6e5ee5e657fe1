use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_common::tracking::{
    DEFAULT_API_URL, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SCAN_INTERVAL_HOURS,
    STORAGE_KEY, TrackingClientConfig,
};

const DEFAULT_CONFIG_FILE: &str = "server_track17.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "17TRACK package tracking service", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "TRACK17_PORT", help = "Port for the operator HTTP API.")]
    pub port: Option<u16>,

    #[clap(long, env = "TRACK17_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TRACK17_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TRACK17_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "TRACK17_API_KEY", help = "17TRACK API key sent as the 17token header.")]
    pub api_key: Option<String>,

    #[clap(long, env = "TRACK17_API_URL", help = "Base URL of the 17TRACK API.")]
    pub api_url: Option<String>,

    #[clap(long, env = "TRACK17_STORAGE_PATH", help = "File holding the tracked package list.")]
    pub storage_path: Option<PathBuf>,

    #[clap(long, env = "TRACK17_SCAN_INTERVAL_HOURS", help = "Hours between scheduled refreshes.")]
    pub scan_interval_hours: Option<u64>,

    #[clap(long, env = "TRACK17_CONCURRENCY_LIMIT", help = "Maximum simultaneous API requests.")]
    pub concurrency_limit: Option<usize>,

    #[clap(long, env = "TRACK17_REQUEST_TIMEOUT_SECS", help = "Per-request timeout in seconds.")]
    pub request_timeout_secs: Option<u64>,

    #[clap(long, env = "TRACK17_MAX_RETRIES", help = "Retries for transient HTTP failures.")]
    pub max_retries: Option<u32>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            api_key: other.api_key.or(self.api_key),
            api_url: other.api_url.or(self.api_url),
            storage_path: other.storage_path.or(self.storage_path),
            scan_interval_hours: other.scan_interval_hours.or(self.scan_interval_hours),
            concurrency_limit: other.concurrency_limit.or(self.concurrency_limit),
            request_timeout_secs: other.request_timeout_secs.or(self.request_timeout_secs),
            max_retries: other.max_retries.or(self.max_retries),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9017),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            api_url: Some(DEFAULT_API_URL.to_string()),
            storage_path: Some(Path::new("./.storage").join(STORAGE_KEY)),
            scan_interval_hours: Some(DEFAULT_SCAN_INTERVAL_HOURS),
            concurrency_limit: Some(DEFAULT_CONCURRENCY_LIMIT),
            request_timeout_secs: Some(DEFAULT_REQUEST_TIMEOUT.as_secs()),
            max_retries: Some(0),
            ..Default::default()
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub api_key: String,
    pub api_url: String,
    pub storage_path: PathBuf,
    pub scan_interval: Duration,
    pub concurrency_limit: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl Settings {
    pub fn client_config(&self) -> TrackingClientConfig {
        TrackingClientConfig {
            base_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            timeout: self.request_timeout,
            max_retries: self.max_retries,
        }
    }
}

impl TryFrom<Config> for Settings {
    type Error = anyhow::Error;

    fn try_from(config: Config) -> Result<Self> {
        let defaults = Config::defaults();
        let api_key = match config.api_key {
            Some(key) if !key.trim().is_empty() => key,
            _ => bail!("An API key is required (--api-key or TRACK17_API_KEY)"),
        };
        let scan_interval_hours = config.scan_interval_hours.unwrap_or(DEFAULT_SCAN_INTERVAL_HOURS);
        if scan_interval_hours == 0 {
            bail!("scan_interval_hours must be at least 1");
        }

        Ok(Settings {
            port: config.port.or(defaults.port).unwrap_or_default(),
            log_dir: config.log_dir.or(defaults.log_dir).unwrap_or_default(),
            log_level: config.log_level.or(defaults.log_level).unwrap_or_default(),
            api_key,
            api_url: config.api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            storage_path: config.storage_path.or(defaults.storage_path).unwrap_or_default(),
            scan_interval: Duration::from_secs(scan_interval_hours * 3600),
            concurrency_limit: config.concurrency_limit.unwrap_or(DEFAULT_CONCURRENCY_LIMIT),
            request_timeout: Duration::from_secs(
                config.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT.as_secs()),
            ),
            max_retries: config.max_retries.unwrap_or(0),
        })
    }
}

pub fn load_config() -> Result<Settings> {
    // .env values become environment variables before clap reads them
    if let Ok(path) = dotenvy::dotenv() {
        log::debug!("Loaded environment from {}", path.display());
    }
    resolve(Config::parse())
}

/// Layers defaults < config file < CLI/env and validates the result.
pub fn resolve(cli: Config) -> Result<Settings> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        let file_config = read_config_file(&config_file_path)?;
        current_config = current_config.merge(file_config);
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current_config = current_config.merge(cli);
    Settings::try_from(current_config)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&config_str)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

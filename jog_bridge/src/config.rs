use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_FILE: &str = "jog_bridge.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read configuration file: {source}")]
    ReadError { source: std::io::Error },

    #[error("Failed to parse configuration: {source}")]
    ParseError { source: toml::de::Error },

    #[error("Failed to serialize configuration: {source}")]
    SerializeError { source: toml::ser::Error },

    #[error("Failed to write configuration file: {source}")]
    WriteError { source: std::io::Error },

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandChannelConfig {
    pub host: String,
    pub port: u16,
    pub greeting: String,
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    /// Connect again after the client closes the channel.
    pub reconnect: bool,
    pub read_buffer_size: usize,
    pub max_line_length: usize,
    /// A client that stops reading for this long is detached.
    pub write_timeout_ms: u64,
}

impl Default for CommandChannelConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 53019,
            greeting: "Paper Tools connected.".to_string(),
            connect_retries: 3,
            retry_delay_ms: 1000,
            reconnect: false,
            read_buffer_size: 1024,
            max_line_length: utilities::line_framer::DEFAULT_MAX_LINE_LENGTH,
            write_timeout_ms: 1000,
        }
    }
}

impl CommandChannelConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileChannelConfig {
    pub host: String,
    pub port: u16,
    pub max_bytes: usize,
}

impl Default for FileChannelConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 53020,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

impl FileChannelConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            poll_timeout_ms: 80,
        }
    }
}

impl ReportingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    Grbl,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub kind: MachineKind,
    pub host: String,
    pub port: u16,
    pub connect_retries: u32,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            kind: MachineKind::Grbl,
            host: "127.0.0.1".to_string(),
            port: 23,
            connect_retries: 3,
            connect_timeout_ms: 1000,
            io_timeout_ms: 100,
            response_timeout_ms: 2000,
        }
    }
}

impl MachineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    pub level: String,
    pub json: bool,
    /// Daily-rolling log files are written here when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub command_channel: CommandChannelConfig,
    pub file_channel: FileChannelConfig,
    pub reporting: ReportingConfig,
    pub machine: MachineConfig,
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: &str| {
            Err(ConfigError::ValidationError {
                message: message.to_string(),
            })
        };

        if self.reporting.poll_interval_ms == 0 {
            return fail("reporting.poll_interval_ms must be greater than zero");
        }
        if self.reporting.poll_timeout_ms == 0
            || self.reporting.poll_timeout_ms > self.reporting.poll_interval_ms
        {
            return fail("reporting.poll_timeout_ms must be between 1 and poll_interval_ms");
        }
        if self.command_channel.read_buffer_size == 0 {
            return fail("command_channel.read_buffer_size must be greater than zero");
        }
        if self.command_channel.max_line_length == 0 {
            return fail("command_channel.max_line_length must be greater than zero");
        }
        if self.command_channel.write_timeout_ms == 0 {
            return fail("command_channel.write_timeout_ms must be greater than zero");
        }
        if self.command_channel.port == 0 || self.file_channel.port == 0 {
            return fail("channel ports must be non-zero");
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct ConfigOptions {
    pub config_path: PathBuf,
    pub create_if_missing: bool,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            create_if_missing: true,
        }
    }
}

impl ConfigOptions {
    pub fn default_config_path() -> PathBuf {
        std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigManager {
    options: ConfigOptions,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigOptions) -> Self {
        Self { options }
    }

    pub fn path(&self) -> &Path {
        &self.options.config_path
    }

    pub fn load(&self) -> anyhow::Result<BridgeConfig> {
        let config_path = &self.options.config_path;

        if !config_path.exists() {
            if self.options.create_if_missing {
                let default_config = BridgeConfig::default();
                self.save(&default_config)
                    .context("Failed to save default config")?;
                return Ok(default_config);
            } else {
                return Err(ConfigError::FileNotFound {
                    path: config_path.clone(),
                }
                .into());
            }
        }

        let content =
            fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError { source: e })?;

        let config: BridgeConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError { source: e })?;

        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, config: &BridgeConfig) -> anyhow::Result<()> {
        let config_path = &self.options.config_path;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError { source: e })?;
        }

        let content = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::SerializeError { source: e })?;

        fs::write(config_path, content).map_err(|e| ConfigError::WriteError { source: e })?;

        Ok(())
    }
}

pub fn init_config() -> anyhow::Result<(ConfigManager, BridgeConfig)> {
    init_config_with_options(ConfigOptions::default())
}

pub fn init_config_with_options(
    options: ConfigOptions,
) -> anyhow::Result<(ConfigManager, BridgeConfig)> {
    let manager = ConfigManager::with_options(options);
    let config = manager.load()?;
    Ok((manager, config))
}

pub fn create_default_config<P: AsRef<Path>>(path: Option<P>) -> anyhow::Result<()> {
    let config_path = path
        .map(|p| p.as_ref().to_path_buf())
        .unwrap_or_else(ConfigOptions::default_config_path);

    let manager = ConfigManager::with_options(ConfigOptions {
        config_path,
        create_if_missing: true,
    });
    manager.save(&BridgeConfig::default())?;

    Ok(())
}

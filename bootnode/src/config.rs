use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tos_bootnode_common::{
    config::{BOOTNODE_NAME, DEFAULT_BOOTNODE_BIND_ADDRESS, VERSION},
    logger::{default_logs_datetime_format, LogLevel, LoggerConfig, ModuleConfig},
};

use crate::bootstrap::DiscoveryMode;
use crate::discovery::routing_table::DEFAULT_BUCKET_SIZE;
use crate::error::{BootnodeError, BootnodeResult};

fn default_bind_address() -> String {
    DEFAULT_BOOTNODE_BIND_ADDRESS.to_string()
}

fn default_nat() -> String {
    "none".to_string()
}

fn default_bucket_size() -> usize {
    DEFAULT_BUCKET_SIZE
}

fn default_log_filename() -> String {
    format!("{}.log", BOOTNODE_NAME)
}

fn default_logs_path() -> String {
    "logs/".to_string()
}

#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct LogConfig {
    /// Set log level
    #[clap(long, value_enum, default_value_t)]
    #[serde(default)]
    pub log_level: LogLevel,
    /// Set file log level
    /// By default, it will be the same as log level
    #[clap(long, value_enum)]
    #[serde(default)]
    pub file_log_level: Option<LogLevel>,
    /// Level override for a module, written `<module>=<level>`
    #[clap(long = "log-module")]
    #[serde(default)]
    pub log_modules: Vec<ModuleConfig>,
    /// Disable the usage of colors in log
    #[clap(long)]
    #[serde(default)]
    pub disable_log_color: bool,
    /// Disable the log file
    #[clap(long)]
    #[serde(default)]
    pub disable_file_logging: bool,
    /// Logs directory
    ///
    /// By default it will be logs/ of the current directory.
    #[clap(long, default_value_t = default_logs_path())]
    #[serde(default = "default_logs_path")]
    pub logs_path: String,
    /// Log filename, stored in the logs directory
    #[clap(long, default_value_t = default_log_filename())]
    #[serde(default = "default_log_filename")]
    pub filename_log: String,
    /// Change the datetime format used by the logger
    #[clap(long, default_value_t = default_logs_datetime_format())]
    #[serde(default = "default_logs_datetime_format")]
    pub datetime_format: String,
}

impl LogConfig {
    pub fn to_logger_config(&self) -> LoggerConfig {
        LoggerConfig {
            level: self.log_level,
            file_level: self.file_log_level.unwrap_or(self.log_level),
            modules: self.log_modules.clone(),
            colors: !self.disable_log_color,
            file: (!self.disable_file_logging).then(|| Path::new(&self.logs_path).join(&self.filename_log)),
            datetime_format: self.datetime_format.clone(),
        }
    }
}

#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct BootnodeConfig {
    /// Listen address of the discovery protocol, `:<port>` for all interfaces
    #[clap(long, default_value_t = default_bind_address())]
    #[serde(default = "default_bind_address")]
    pub addr: String,
    /// Generate a node key, write it to this file and exit
    #[clap(long)]
    #[serde(default)]
    pub genkey: Option<PathBuf>,
    /// Print the node ID of the loaded key and exit
    #[clap(long)]
    #[serde(default)]
    pub writeaddress: bool,
    /// File holding the hex encoded node key
    #[clap(long)]
    #[serde(default)]
    pub nodekey: Option<PathBuf>,
    /// Hex encoded node key
    #[clap(long)]
    #[serde(default)]
    pub nodekeyhex: Option<String>,
    /// Port mapping mechanism: none|any|upnp|pmp|pmp:<gateway>|extip:<ip>
    #[clap(long, default_value_t = default_nat())]
    #[serde(default = "default_nat")]
    pub nat: String,
    /// Restrict network communication to the given comma separated CIDRs
    #[clap(long)]
    #[serde(default)]
    pub netrestrict: Option<String>,
    /// Run the topic discovery engine instead of the legacy one
    #[clap(long)]
    #[serde(default)]
    pub v5: bool,
    /// Path-aware listen address, `<ISD>-<AS>,[<host>]:<port>`
    #[clap(long)]
    #[serde(default)]
    pub scion: Option<String>,
    /// Comma separated tosnode:// URLs of other bootnodes
    #[clap(long, value_delimiter = ',')]
    #[serde(default)]
    pub bootnodes: Vec<String>,
    /// Nodes kept per routing table bucket
    #[clap(long, default_value_t = default_bucket_size())]
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,
}

impl BootnodeConfig {
    pub fn mode(&self) -> DiscoveryMode {
        if self.v5 {
            DiscoveryMode::Topic
        } else {
            DiscoveryMode::Legacy
        }
    }
}

#[derive(Debug, Parser, Serialize, Deserialize, Clone)]
#[clap(
    version = VERSION,
    about = "TOS Bootnode - entry point of the TOS peer discovery network"
)]
#[command(styles = tos_bootnode_common::get_cli_styles())]
pub struct Config {
    #[clap(flatten)]
    pub bootnode: BootnodeConfig,
    /// Log configuration
    #[clap(flatten)]
    pub log: LogConfig,
    /// JSON file to load the configuration from
    /// All other CLI options are ignored when it is set
    #[clap(long)]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
    /// Write the current configuration to --config-file and exit
    #[clap(long)]
    #[serde(skip)]
    pub generate_config_template: bool,
}

impl Config {
    pub fn from_file(path: &Path) -> BootnodeResult<Self> {
        let invalid = |reason: String| BootnodeError::InvalidConfigFile {
            path: path.to_path_buf(),
            reason,
        };
        let file = File::open(path).map_err(|e| invalid(e.to_string()))?;
        let mut config: Config = serde_json::from_reader(file).map_err(|e| invalid(e.to_string()))?;
        config.config_file = Some(path.to_path_buf());
        Ok(config)
    }

    /// Refuses to overwrite an existing file.
    pub fn write_template(&self, path: &Path) -> BootnodeResult<()> {
        let invalid = |reason: String| BootnodeError::InvalidConfigFile {
            path: path.to_path_buf(),
            reason,
        };
        if path.exists() {
            return Err(invalid("file already exists".to_string()));
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| invalid(e.to_string()))?;
        let mut file = File::create(path).map_err(|e| invalid(e.to_string()))?;
        file.write_all(json.as_bytes()).map_err(|e| invalid(e.to_string()))
    }
}

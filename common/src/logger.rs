//! Process-wide logger built on fern.
//!
//! The logger is installed once at process entry and never reconfigured.
//! Console output goes to stderr (optionally coloured), file output is plain
//! text. Per-module overrides apply to both outputs.

use std::{fmt, fs, io, path::PathBuf, str::FromStr};

use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub fn default_logs_datetime_format() -> String {
    "[%Y-%m-%d] (%H:%M:%S%.3f)".to_string()
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),
    #[error("invalid log module '{0}', expected <module>=<level>")]
    InvalidModule(String),
    #[error("cannot open log file: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    SetLogger(#[from] log::SetLoggerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

// Accepts level names and numeric verbosities (0 = off .. 5 = trace)
impl FromStr for LogLevel {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "warning" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => return Err(LoggerError::InvalidLevel(s.to_string())),
        })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// Level override for one module path, written `module=level`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub module: String,
    pub level: LogLevel,
}

impl FromStr for ModuleConfig {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (module, level) = s
            .split_once('=')
            .ok_or_else(|| LoggerError::InvalidModule(s.to_string()))?;
        let module = module.trim();
        if module.is_empty() {
            return Err(LoggerError::InvalidModule(s.to_string()));
        }
        Ok(Self {
            module: module.to_string(),
            level: level.parse()?,
        })
    }
}

impl fmt::Display for ModuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.module, self.level)
    }
}

/// Everything the logger needs, resolved from the CLI/config file.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub level: LogLevel,
    pub file_level: LogLevel,
    pub modules: Vec<ModuleConfig>,
    pub colors: bool,
    /// `None` disables file logging.
    pub file: Option<PathBuf>,
    pub datetime_format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file_level: LogLevel::Info,
            modules: Vec::new(),
            colors: true,
            file: None,
            datetime_format: default_logs_datetime_format(),
        }
    }
}

fn apply_modules(mut dispatch: fern::Dispatch, modules: &[ModuleConfig]) -> fern::Dispatch {
    for module in modules {
        dispatch = dispatch.level_for(module.module.clone(), module.level.into());
    }
    dispatch
}

/// Install the global logger. Fails if a logger is already installed.
pub fn init_logger(config: &LoggerConfig) -> Result<(), LoggerError> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Magenta)
        .trace(Color::Cyan);

    let use_colors = config.colors;
    let format = config.datetime_format.clone();
    let console = fern::Dispatch::new()
        .level(config.level.into())
        .format(move |out, message, record| {
            let now = chrono::Local::now().format(&format);
            if use_colors {
                out.finish(format_args!(
                    "{} {:>5} {} > {}",
                    now,
                    colors.color(record.level()),
                    record.target(),
                    message
                ))
            } else {
                out.finish(format_args!(
                    "{} {:>5} {} > {}",
                    now,
                    record.level(),
                    record.target(),
                    message
                ))
            }
        })
        .chain(io::stderr());

    let mut root = fern::Dispatch::new().chain(apply_modules(console, &config.modules));

    if let Some(path) = &config.file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let format = config.datetime_format.clone();
        let file = fern::Dispatch::new()
            .level(config.file_level.into())
            .format(move |out, message, record| {
                out.finish(format_args!(
                    "{} {:>5} {} > {}",
                    chrono::Local::now().format(&format),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .chain(fern::log_file(path)?);
        root = root.chain(apply_modules(file, &config.modules));
    }

    root.apply()?;
    log_panics::init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("5".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("0".parse::<LogLevel>().unwrap(), LogLevel::Off);
        assert!("9".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_level_display_roundtrip() {
        for level in [
            LogLevel::Off,
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_module_config() {
        let module: ModuleConfig = "tos_bootnode::discovery=trace".parse().unwrap();
        assert_eq!(module.module, "tos_bootnode::discovery");
        assert_eq!(module.level, LogLevel::Trace);
        assert_eq!(module.to_string(), "tos_bootnode::discovery=trace");

        assert!("no-separator".parse::<ModuleConfig>().is_err());
        assert!("=debug".parse::<ModuleConfig>().is_err());
        assert!("module=loud".parse::<ModuleConfig>().is_err());
    }

    #[test]
    fn test_level_filter_conversion() {
        assert_eq!(LevelFilter::from(LogLevel::Off), LevelFilter::Off);
        assert_eq!(LevelFilter::from(LogLevel::Debug), LevelFilter::Debug);
    }
}

//! Logging setup
//!
//! All Kiln binaries log through `tracing`. This module installs the global
//! subscriber: an [`EnvFilter`] built from the configured level plus optional
//! directives, a console layer, and an optional daily-rolling file layer. Each
//! layer renders either human-readable text or JSON lines.
//!
//! Settings are read from the environment:
//!
//! - `KILN_LOG_LEVEL`: trace, debug, info, warn, error
//! - `KILN_LOG_FORMAT`: text or json
//! - `KILN_LOG_OUTPUT`: console, file or both
//! - `KILN_LOG_DIR`: directory for rolling log files
//! - `KILN_LOG_FILTER`: extra directives, e.g. `sqlx=warn,kiln_ingest=debug`
//!
//! ```no_run
//! use kiln_common::logging::{init_logging, LogSettings};
//!
//! let settings = LogSettings::from_env().unwrap_or_default();
//! init_logging(&settings).ok();
//! tracing::info!("ready");
//! ```

use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(KilnError::config(format!("invalid log level: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(KilnError::config(format!("invalid log format: {other}"))),
        }
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl FromStr for LogOutput {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            other => Err(KilnError::config(format!("invalid log output: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    pub dir: PathBuf,
    /// File name prefix for the rolling appender ("kiln" -> "kiln.2026-01-18")
    pub file_prefix: String,
    pub directives: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            output: LogOutput::Console,
            dir: PathBuf::from("./logs"),
            file_prefix: "kiln".to_string(),
            directives: None,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(level) = std::env::var("KILN_LOG_LEVEL") {
            settings.level = level.parse()?;
        }
        if let Ok(format) = std::env::var("KILN_LOG_FORMAT") {
            settings.format = format.parse()?;
        }
        if let Ok(output) = std::env::var("KILN_LOG_OUTPUT") {
            settings.output = output.parse()?;
        }
        if let Ok(dir) = std::env::var("KILN_LOG_DIR") {
            settings.dir = PathBuf::from(dir);
        }
        settings.directives = std::env::var("KILN_LOG_FILTER").ok().filter(|d| !d.is_empty());

        Ok(settings)
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.as_level().into());
        if let Some(directives) = &self.directives {
            for directive in directives.split(',').filter(|d| !d.trim().is_empty()) {
                let parsed = directive
                    .trim()
                    .parse()
                    .map_err(|e| KilnError::config(format!("bad log directive {directive}: {e}")))?;
                filter = filter.add_directive(parsed);
            }
        }
        Ok(filter)
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(settings: &LogSettings) -> Result<()> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if settings.output.console() {
        let layer = fmt::layer().with_writer(std::io::stdout).with_target(true);
        layers.push(match settings.format {
            LogFormat::Text => layer.boxed(),
            LogFormat::Json => layer.json().boxed(),
        });
    }

    if settings.output.file() {
        std::fs::create_dir_all(&settings.dir)?;
        let appender = tracing_appender::rolling::daily(&settings.dir, &settings.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // the worker must outlive every log call
        std::mem::forget(guard);

        let layer = fmt::layer().with_writer(writer).with_ansi(false);
        layers.push(match settings.format {
            LogFormat::Text => layer.boxed(),
            LogFormat::Json => layer.json().boxed(),
        });
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(settings.filter()?)
        .try_init()
        .map_err(|e| KilnError::config(format!("logging already initialized: {e}")))
}

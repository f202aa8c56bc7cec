//! Logging setup
//!
//! The library only emits `tracing` events; binaries decide where they go.
//! [`setup_logging`] sends them to stderr so that stdout stays free for
//! command output. `RUST_LOG`, when set, replaces the configured filter.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

/// Targets the configured level applies to; everything else logs at `warn`
const RTPSRC_TARGETS: &[&str] = &["rtpsrc_core", "rtpsrc"];

/// Line format on stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// How rtpsrc diagnostics are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Include file and line of each event
    pub source_locations: bool,
    /// Log span enter and exit
    pub spans: bool,
}

impl LoggingConfig {
    /// Text output at `level`, given by name (`debug`, `WARN`, ...)
    pub fn for_level(level: &str) -> Result<Self> {
        let level = Level::from_str(level)
            .map_err(|_| Error::Config(format!("unknown log level '{}'", level)))?;
        Ok(Self {
            level,
            format: LogFormat::Text,
            source_locations: false,
            spans: false,
        })
    }

    /// Filter directives used when `RUST_LOG` is not set
    pub fn directives(&self) -> String {
        let level = self.level.to_string().to_ascii_lowercase();
        let mut directives = String::from("warn");
        for target in RTPSRC_TARGETS {
            directives.push_str(&format!(",{}={}", target, level));
        }
        directives
    }
}

/// Install the global subscriber
///
/// Fails with [`Error::Config`] if a global subscriber is already set.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.directives())
            .map_err(|e| Error::Config(format!("bad log filter: {}", e)))?,
    };

    let span_events = if config.spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_writer(std::io::stderr)
        .with_file(config.source_locations)
        .with_line_number(config.source_locations);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };

    installed.map_err(|e| Error::Config(format!("logger already installed: {}", e)))
}

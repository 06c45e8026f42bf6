//! Subscriber setup for the offline crates.
//!
//! Everything logs through `tracing`; this module only picks the filter and
//! the output format. Output always goes to stderr.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// HTTP stack targets held at `warn` when our own crates log verbosely.
const NOISY_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// JSON objects, one per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::OfflineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(crate::OfflineError::InvalidArgument(format!(
                "unknown log format '{}'",
                other
            ))),
        }
    }
}

/// How the process logs.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Source file and line on each event (pretty format only).
    pub include_location: bool,
    /// Span enter/close events.
    pub include_span_events: bool,
    /// Filter directives that override everything else,
    /// e.g. "offline_sw=trace,offline_page=debug".
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Verbose output for working on the cache and lifecycle code.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// JSON at `info`, for log collectors.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Effective filter directives.
    ///
    /// An explicit filter wins, then `env` (the `RUST_LOG` value), then the
    /// level. Below `info` the HTTP stack stays at `warn`.
    pub fn directives(&self, env: Option<&str>) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        if let Some(env) = env.filter(|e| !e.trim().is_empty()) {
            return env.to_string();
        }

        let mut directives = vec![self.level.as_str().to_ascii_lowercase()];
        if self.level > Level::INFO {
            directives.extend(NOISY_TARGETS.iter().map(|target| format!("{}=warn", target)));
        }
        directives.join(",")
    }
}

/// Install the global subscriber. Call once per process.
pub fn init_logging(config: LogConfig) {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directives = config.directives(env.as_deref());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Warning: bad log filter '{}': {}", directives, e);
        EnvFilter::new(config.level.as_str())
    });

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let output = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(true)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_span_events(span_events)
            .boxed(),
    };

    tracing_subscriber::registry().with(filter).with(output).init();
}

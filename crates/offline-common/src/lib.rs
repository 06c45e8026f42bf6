//! # Offline Common
//!
//! Shared error type, logging configuration, and deployment configuration for
//! the offline shell crates.
//!
//! ## Features
//!
//! - Unified configuration error type
//! - Logging configuration and setup
//! - Deployment configuration (cache generation, manifest, scope, timers)

use thiserror::Error;

pub mod config;
pub mod logging;

pub use config::OfflineConfig;
pub use logging::{init_logging, LogConfig, LogFormat};

/// Unified error type for configuration and setup.
#[derive(Error, Debug)]
pub enum OfflineError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A path that cannot be resolved against the origin.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl OfflineError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            OfflineError::Config { .. } => "config",
            OfflineError::Io(_) => "io",
            OfflineError::Json(_) => "json",
            OfflineError::InvalidUrl(_) => "invalid_url",
            OfflineError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for configuration and setup.
pub type Result<T> = std::result::Result<T, OfflineError>;

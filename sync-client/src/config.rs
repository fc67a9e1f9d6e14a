//! Configuration for the ingestion engine.
//!
//! Only describes what this engine consumes. Locating and loading the host
//! application's config file is the host's job; [`IngestConfig::from_file`]
//! is provided for hosts that keep these settings in their own TOML file.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use larch_sync_core::ContentOptions;

/// Root configuration for the ingestion engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    /// Steady-state transport timeouts handed to the transport after the
    /// first successful batch.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Local content derivation.
    #[serde(default)]
    pub content: ContentConfig,
}

/// Steady-state transport timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransportConfig {
    /// Response header timeout in seconds (default: 60).
    #[serde(default = "default_response_header_timeout_secs")]
    pub response_header_timeout_secs: u64,
    /// Whole-request timeout in seconds (default: 180).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Local content derivation settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContentConfig {
    /// Plain-text messages shorter than this (in characters) may be shown
    /// as big emoji (default: 100).
    #[serde(default = "default_big_emoji_max_len")]
    pub big_emoji_max_len: usize,
    /// Wrap URLs in anchors (default: true).
    #[serde(default = "default_linkify")]
    pub linkify: bool,
}

fn default_response_header_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    180
}

fn default_big_emoji_max_len() -> usize {
    larch_sync_core::content::DEFAULT_BIG_EMOJI_MAX_LEN
}

fn default_linkify() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            response_header_timeout_secs: default_response_header_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            big_emoji_max_len: default_big_emoji_max_len(),
            linkify: default_linkify(),
        }
    }
}

impl TransportConfig {
    /// Timeouts to hand to the transport once initial sync is done.
    pub fn steady_state(&self) -> SteadyStateTimeouts {
        SteadyStateTimeouts {
            response_header_timeout: Duration::from_secs(self.response_header_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

impl ContentConfig {
    /// Options for [`larch_sync_core::derive_local_content`].
    pub fn options(&self) -> ContentOptions {
        ContentOptions {
            big_emoji_max_len: self.big_emoji_max_len,
            linkify: self.linkify,
        }
    }
}

/// Transport timeouts for steady-state long polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SteadyStateTimeouts {
    /// Time allowed until response headers arrive.
    pub response_header_timeout: Duration,
    /// Time allowed for the whole request.
    pub request_timeout: Duration,
}

impl IngestConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

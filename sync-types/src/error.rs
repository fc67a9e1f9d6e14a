//! Error types for Larch data model parsing.

use thiserror::Error;

/// Errors that can occur while interpreting event content.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Content URI is not of the form `mxc://server/media_id`.
    #[error("invalid content URI: {0}")]
    InvalidContentUri(String),

    /// Event content did not match the shape its type declares.
    #[error("malformed {event_type} content: {source}")]
    MalformedContent {
        /// The declared event type.
        event_type: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

//! Error types for sync ingestion.

use larch_sync_types::RoomId;
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::store::StoreError;

/// Why a pagination task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// The room's timeline was discarded after a history gap.
    TimelineReset,
}

impl std::fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimelineReset => f.write_str("timeline reset"),
        }
    }
}

/// Errors that abort an ingest or pagination call.
#[derive(Debug, Error)]
pub enum SyncProcessingError {
    /// A storage call failed.
    #[error("{context}: {source}")]
    Store {
        /// What was being done.
        context: String,
        /// Underlying storage error.
        #[source]
        source: StoreError,
    },

    /// A crypto collaborator call failed.
    #[error("{context}: {source}")]
    Crypto {
        /// What was being done.
        context: String,
        /// Underlying crypto error.
        #[source]
        source: CryptoError,
    },

    /// Pagination was cancelled before committing.
    #[error("pagination interrupted: {0}")]
    PaginationInterrupted(InterruptReason),

    /// A pagination task is already running for the room.
    #[error("pagination already in progress for {0}")]
    PaginationInProgress(RoomId),

    /// The caller-supplied history fetch failed.
    #[error("failed to fetch history: {0}")]
    HistoryFetch(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result alias for ingestion.
pub type Result<T> = std::result::Result<T, SyncProcessingError>;

/// Attach context to storage results.
pub trait StoreResultExt<T> {
    /// Wrap a storage error with a description of what was being done.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Like [`StoreResultExt::context`], building the description lazily.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> StoreResultExt<T> for std::result::Result<T, StoreError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| SyncProcessingError::Store {
            context: context.into(),
            source,
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|source| SyncProcessingError::Store {
            context: f(),
            source,
        })
    }
}

/// Attach context to crypto results.
pub trait CryptoResultExt<T> {
    /// Wrap a crypto error with a description of what was being done.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> CryptoResultExt<T> for std::result::Result<T, CryptoError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| SyncProcessingError::Crypto {
            context: context.into(),
            source,
        })
    }
}

//! # sync-client
//!
//! Sync batch ingestion and room reconciliation for Larch.
//!
//! This crate drives the pure logic in `sync-core` against three
//! collaborators supplied by the host:
//!
//! - [`Store`]: the local event, timeline and room database
//! - [`Crypto`]: megolm decryption and to-device key handling
//! - [`PushRules`]: notification classification
//!
//! ## Features
//!
//! - **Idempotent ingestion**: re-applying a batch changes nothing and
//!   publishes nothing for the rooms it already covered
//! - **Decryption retry**: failed events queue a minimum-index session
//!   request and wake the re-request worker
//! - **Backward pagination**: history pages are prepended, and a limited
//!   sync cancels any pagination running for the room
//! - **Status tracking**: `Waiting`, `Syncing` and `Errored` transitions are
//!   published as they happen
//!
//! ## Example
//!
//! ```ignore
//! use larch_sync_client::{IngestConfig, Ingestor, MemoryStore, MockCrypto, StaticPushRules};
//!
//! let own = UserId::new("@me:example.org");
//! let (ingestor, mut handles) = Ingestor::new(
//!     own.clone(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MockCrypto::new()),
//!     Arc::new(StaticPushRules::new(own)),
//!     IngestConfig::default(),
//! );
//!
//! let complete = ingestor.ingest(&batch, since).await?;
//! while let Ok(event) = handles.events.try_recv() {
//!     render(event);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod ingest;
pub(crate) mod normalize;
pub mod pagination;
pub mod push;
pub(crate) mod reconcile;
pub mod store;
pub mod to_device;

pub use config::{ConfigError, ContentConfig, IngestConfig, SteadyStateTimeouts, TransportConfig};
pub use crypto::{
    Crypto, CryptoError, DecryptedEvent, DecryptionError, MockCrypto, RoomKeyRequest,
    RoomKeyWithheld, SecretRequest,
};
pub use error::{CryptoResultExt, InterruptReason, Result, StoreResultExt, SyncProcessingError};
pub use ingest::{ClientEvent, HistoryPage, IngestHandles, Ingestor, PaginationResult};
pub use pagination::{PaginationGuard, PaginationRegistry};
pub use push::{PushRules, PushRulesError, StaticPushRules};
pub use store::{MemoryStore, Store, StoreError};
pub use to_device::{apply_deferred, route_to_device, DeferredToDevice};

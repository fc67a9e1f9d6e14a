//! # sync-core
//!
//! Pure logic for Larch sync ingestion (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for ingesting
//! sync batches without any network, disk or crypto I/O, enabling fast
//! unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects:
//! - [`status`]: sync status transitions
//! - [`naming`]: room names from lazy-load heroes
//! - [`retry`]: per-batch decryption retry requests and megolm header parsing
//! - [`reply`]: legacy reply fallback removal
//! - [`content`]: sanitized HTML, linkify, edit sources, big emoji
//! - [`room`]: room aggregate rules and structural diffing
//!
//! The actual I/O (storage, decryption, notification) is performed by
//! `sync-client`, which drives these functions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod content;
pub mod naming;
pub mod reply;
pub mod retry;
pub mod room;
pub mod status;

pub use content::{
    derive_local_content, needs_reprocess, ContentError, ContentOptions, DerivedContent,
    CURRENT_SANITIZER_VERSION,
};
pub use naming::{join_member_names, participant_name, HeroMember, ParticipantName};
pub use reply::strip_reply_fallback;
pub use retry::{
    megolm_message_index_or_zero, parse_megolm_message_index, DecryptionRetryQueue,
    MegolmIndexError,
};
pub use room::{
    apply_state_event, bump_sorting_timestamp, diff_rooms, reconcile_summary, RoomField,
    SummaryUpdate,
};
pub use status::{StatusEvent, SyncStatusMachine};

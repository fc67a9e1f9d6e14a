//! # sync-types
//!
//! Data model for the Larch sync ingestion engine.
//!
//! This crate provides the foundational types used across all Larch crates:
//! - [`RoomId`], [`UserId`], [`EventId`], [`SessionId`], [`EventRowId`] - Identity types
//! - [`SyncBatch`] - Decoded server sync delta
//! - [`Event`], [`Room`], [`Receipt`], [`SessionRequest`] - Stored rows
//! - [`SyncComplete`], [`SyncStatus`] - Published change notifications
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod batch;
mod error;
mod event;
mod ids;
mod output;
mod records;
mod room;

pub use batch::{
    AccountDataEvent, DeviceLists, EphemeralEvent, EventList, JoinedRoom, LeftRoom, Rooms,
    SyncBatch, Timeline, ToDeviceEvent,
};
pub use error::TypesError;
pub use event::{
    event_type, Event, EventKind, LocalContent, Membership, RawEvent, RelationType, UnreadType,
    Unsigned,
};
pub use ids::{ContentUri, EventId, EventRowId, RoomId, SessionId, TimelineRowId, UserId};
pub use output::{SyncComplete, SyncNotification, SyncRoom, SyncStatus, Typing};
pub use records::{
    AccountData, CurrentStateEntry, Media, Receipt, SessionRequest, TimelineRowTuple,
    RECEIPT_TYPE_READ, RECEIPT_TYPE_READ_PRIVATE,
};
pub use room::{
    EncryptionContent, LazyLoadSummary, NameQuality, Room, TombstoneContent, UnreadCounts,
    SORTING_TIMESTAMP_UNSET,
};

//! Storage abstraction for sync ingestion.
//!
//! The engine only uses this narrow contract; the transactional storage
//! engine behind it is the host's concern. [`MemoryStore`] implements it
//! in memory for tests and embedding.
//!
//! # Design
//!
//! Every method is a single bounded write or read. Inserting an event
//! returns its row id directly, so media references can be attached in the
//! same pass.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use larch_sync_types::{
    AccountData, ContentUri, Event, EventId, EventRowId, LocalContent, Media, Membership, Receipt,
    Room, RoomId, SessionId, SessionRequest, TimelineRowTuple, UnreadCounts, UserId,
};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A row the operation depends on does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing row.
        what: String,
    },
}

/// Narrow transactional storage contract used by ingestion.
#[async_trait]
pub trait Store: Send + Sync {
    // Events

    /// Get an event by server event id.
    async fn get_event_by_id(&self, event_id: &EventId) -> Result<Option<Event>, StoreError>;

    /// Get an event by local row id.
    async fn get_event_by_row_id(&self, row_id: EventRowId) -> Result<Option<Event>, StoreError>;

    /// Insert an event, or update the mutable fields of an existing row with
    /// the same event id. Returns the row id, which is never reused.
    async fn upsert_event(&self, event: &Event) -> Result<EventRowId, StoreError>;

    /// Replace the derived local content of an event.
    async fn update_local_content(
        &self,
        row_id: EventRowId,
        local_content: Option<&LocalContent>,
    ) -> Result<(), StoreError>;

    /// Mark `target` as redacted by `redaction`. Returns the updated target,
    /// or `None` if it is not stored.
    async fn redact_event(
        &self,
        target: &EventId,
        redaction: &EventId,
    ) -> Result<Option<Event>, StoreError>;

    // Current state

    /// Point (room, type, state key) at an event row.
    async fn set_current_state(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        row_id: EventRowId,
        membership: Option<Membership>,
    ) -> Result<(), StoreError>;

    /// Get the current state event for (room, type, state key).
    async fn get_current_state(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Event>, StoreError>;

    // Timeline

    /// Append rows to the end of a room's timeline. Rows already present
    /// are skipped; only newly added tuples are returned.
    async fn append_timeline(
        &self,
        room_id: &RoomId,
        rows: &[EventRowId],
    ) -> Result<Vec<TimelineRowTuple>, StoreError>;

    /// Insert rows (oldest first) before the start of a room's timeline.
    async fn prepend_timeline(
        &self,
        room_id: &RoomId,
        rows: &[EventRowId],
    ) -> Result<Vec<TimelineRowTuple>, StoreError>;

    /// Drop every cached timeline row of a room.
    async fn clear_timeline(&self, room_id: &RoomId) -> Result<(), StoreError>;

    // Rooms

    /// Get a room row.
    async fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError>;

    /// Create an empty room row if it does not exist.
    async fn create_room(&self, room_id: &RoomId) -> Result<(), StoreError>;

    /// Write a room row.
    async fn upsert_room(&self, room: &Room) -> Result<(), StoreError>;

    /// Delete a room row and everything stored under it.
    async fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError>;

    /// Find the newest event usable as the room list preview.
    async fn recalculate_preview(&self, room_id: &RoomId) -> Result<Option<EventRowId>, StoreError>;

    /// Count unread events after `user_id`'s latest read receipt.
    async fn calculate_unreads(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<UnreadCounts, StoreError>;

    // Receipts

    /// Store receipts; the latest timestamp per (user, type, thread) wins.
    async fn put_receipts(&self, room_id: &RoomId, receipts: &[Receipt]) -> Result<(), StoreError>;

    // Account data

    /// Store account data and return the stored row.
    async fn put_account_data(&self, data: &AccountData) -> Result<AccountData, StoreError>;

    /// Get account data by (user, room, type).
    async fn get_account_data(
        &self,
        user_id: &UserId,
        room_id: Option<&RoomId>,
        data_type: &str,
    ) -> Result<Option<AccountData>, StoreError>;

    // Session requests

    /// Store a session request, merging with an existing one for the same
    /// session by keeping the lower index.
    async fn put_session_request(&self, request: &SessionRequest) -> Result<(), StoreError>;

    /// Get the pending request for a session.
    async fn get_session_request(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionRequest>, StoreError>;

    // Media

    /// Insert or update a media cache row.
    async fn put_media(&self, media: &Media) -> Result<(), StoreError>;

    /// Record that an event references a content URI. Idempotent.
    async fn add_media_reference(&self, row_id: EventRowId, uri: &ContentUri) -> Result<(), StoreError>;

    // Account

    /// Persist the since-token for the next sync request.
    async fn put_next_batch(&self, user_id: &UserId, next_batch: &str) -> Result<(), StoreError>;

    /// Get the persisted since-token.
    async fn get_next_batch(&self, user_id: &UserId) -> Result<Option<String>, StoreError>;
}

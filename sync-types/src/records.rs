//! Stored rows other than events and rooms.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ContentUri, EventId, EventRowId, Membership, RoomId, SessionId, TimelineRowId, UserId};

/// Receipt type for public read receipts.
pub const RECEIPT_TYPE_READ: &str = "m.read";
/// Receipt type for private read receipts.
pub const RECEIPT_TYPE_READ_PRIVATE: &str = "m.read.private";

/// A read receipt. Keyed by (room, user, type, thread).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Room.
    pub room_id: RoomId,
    /// Reader.
    pub user_id: UserId,
    /// Receipt type (`m.read`, `m.read.private`).
    pub receipt_type: String,
    /// Thread the receipt applies to; `None` is unthreaded.
    pub thread_id: Option<String>,
    /// Event read up to.
    pub event_id: EventId,
    /// Receipt timestamp (ms since epoch).
    pub timestamp: i64,
}

impl Receipt {
    /// True for the receipt types that mark messages read.
    pub fn is_read(&self) -> bool {
        self.receipt_type == RECEIPT_TYPE_READ || self.receipt_type == RECEIPT_TYPE_READ_PRIVATE
    }
}

/// A pending request to re-fetch a missing megolm session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Missing session.
    pub session_id: SessionId,
    /// Room the session belongs to.
    pub room_id: RoomId,
    /// Sender of the undecryptable event.
    pub sender: UserId,
    /// Lowest ratchet index still needed.
    pub min_index: u32,
}

impl SessionRequest {
    /// Merge another request for the same session, keeping the lower index.
    pub fn merge(&mut self, other: &SessionRequest) {
        self.min_index = self.min_index.min(other.min_index);
    }
}

/// Account data row. `room_id` is `None` for global account data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountData {
    /// Owning account.
    pub user_id: UserId,
    /// Room, for per-room account data.
    pub room_id: Option<RoomId>,
    /// Account data type.
    pub data_type: String,
    /// Raw content.
    pub content: Value,
}

/// Media cache row keyed by content URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    /// Content URI.
    pub uri: ContentUri,
    /// Original file name, if known.
    pub file_name: Option<String>,
    /// MIME type, if known.
    pub mime_type: Option<String>,
    /// Encrypted-file descriptor for encrypted attachments.
    pub encrypted_file: Option<Value>,
}

impl Media {
    /// A cache row with no metadata.
    pub fn bare(uri: ContentUri) -> Self {
        Self {
            uri,
            file_name: None,
            mime_type: None,
            encrypted_file: None,
        }
    }
}

/// Ordered pointer into a room's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineRowTuple {
    /// Position in the timeline.
    pub timeline_row_id: TimelineRowId,
    /// Event at that position.
    pub event_row_id: EventRowId,
}

/// Latest event for one (type, state key) pair in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentStateEntry {
    /// State event type.
    pub event_type: String,
    /// State key.
    pub state_key: String,
    /// Latest event row.
    pub event_row_id: EventRowId,
    /// Membership, for `m.room.member` entries.
    pub membership: Option<Membership>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(min_index: u32) -> SessionRequest {
        SessionRequest {
            session_id: SessionId::new("s"),
            room_id: RoomId::new("!r:x"),
            sender: UserId::new("@a:x"),
            min_index,
        }
    }

    #[test]
    fn merge_keeps_lower_index() {
        let mut a = request(9);
        a.merge(&request(4));
        assert_eq!(a.min_index, 4);
        a.merge(&request(12));
        assert_eq!(a.min_index, 4);
    }

    #[test]
    fn read_receipt_types() {
        let mut receipt = Receipt {
            room_id: RoomId::new("!r:x"),
            user_id: UserId::new("@a:x"),
            receipt_type: RECEIPT_TYPE_READ.to_string(),
            thread_id: None,
            event_id: EventId::new("$e"),
            timestamp: 1,
        };
        assert!(receipt.is_read());
        receipt.receipt_type = "m.fully_read".to_string();
        assert!(!receipt.is_read());
    }
}

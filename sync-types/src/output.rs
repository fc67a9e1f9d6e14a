//! Change notifications published after ingestion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AccountData, Event, EventRowId, Room, RoomId, TimelineRowTuple, UserId};

/// Aggregated changes from one successful ingest call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncComplete {
    /// Changed rooms.
    pub rooms: BTreeMap<RoomId, SyncRoom>,
    /// Rooms that were left and deleted.
    pub left_rooms: Vec<RoomId>,
    /// Changed global account data, by type.
    pub account_data: BTreeMap<String, AccountData>,
}

impl SyncComplete {
    /// True if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty() && self.left_rooms.is_empty() && self.account_data.is_empty()
    }
}

/// Changes to a single room.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncRoom {
    /// New room snapshot, present only if a tracked field changed.
    pub meta: Option<Room>,
    /// Appended timeline rows.
    pub timeline: Vec<TimelineRowTuple>,
    /// Changed state pointers: type → state key → event row.
    pub state: BTreeMap<String, BTreeMap<String, EventRowId>>,
    /// The cached timeline was discarded before `timeline` was appended.
    pub reset: bool,
    /// New and re-emitted event rows.
    pub events: Vec<Event>,
    /// Changed per-room account data, by type.
    pub account_data: BTreeMap<String, AccountData>,
    /// Events that should raise a user notification.
    pub notifications: Vec<SyncNotification>,
}

impl SyncRoom {
    /// True if the record carries nothing worth publishing.
    pub fn is_empty(&self) -> bool {
        self.meta.is_none()
            && self.timeline.is_empty()
            && self.state.is_empty()
            && self.events.is_empty()
            && self.account_data.is_empty()
            && self.notifications.is_empty()
    }
}

/// A new-message notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNotification {
    /// Event that triggered it.
    pub event_row_id: EventRowId,
    /// Play a sound.
    pub sound: bool,
}

/// Users currently typing in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    /// Room.
    pub room_id: RoomId,
    /// Typing users.
    pub user_ids: Vec<UserId>,
}

/// Health of the sync loop as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncStatus {
    /// No batch processed yet.
    Waiting,
    /// Last batch succeeded.
    Ok,
    /// Last batch failed.
    Errored {
        /// Text of the last error.
        error: String,
        /// Consecutive failures.
        error_count: u32,
        /// Time of the last successful batch (ms since epoch).
        last_sync: Option<i64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_records() {
        assert!(SyncComplete::default().is_empty());
        assert!(SyncRoom::default().is_empty());

        let room = SyncRoom {
            reset: true,
            ..SyncRoom::default()
        };
        // reset alone carries nothing to show
        assert!(room.is_empty());
    }

    #[test]
    fn status_serializes_tagged() {
        let status = SyncStatus::Errored {
            error: "boom".into(),
            error_count: 2,
            last_sync: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "errored");
        assert_eq!(json["error_count"], 2);
    }
}

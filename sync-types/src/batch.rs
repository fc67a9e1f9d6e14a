//! Decoded sync batch shapes.
//!
//! These deserialize directly from the server's sync response field names.
//! Everything defaults to empty so partial responses decode cleanly.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{LazyLoadSummary, RawEvent, RoomId, UserId};

/// A `{"events": [...]}` wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventList<T> {
    /// The wrapped events.
    #[serde(default = "Vec::new")]
    pub events: Vec<T>,
}

impl<T> Default for EventList<T> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

/// One incremental sync delta for an account.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Token to pass as `since` on the next request.
    pub next_batch: String,
    /// Per-room deltas.
    #[serde(default)]
    pub rooms: Rooms,
    /// Account-addressed device messages.
    #[serde(default)]
    pub to_device: EventList<ToDeviceEvent>,
    /// Global account data.
    #[serde(default)]
    pub account_data: EventList<AccountDataEvent>,
    /// Users whose device lists changed.
    #[serde(default)]
    pub device_lists: DeviceLists,
    /// Remaining one-time keys per algorithm.
    #[serde(default)]
    pub device_one_time_keys_count: HashMap<String, u32>,
}

/// Rooms section of a sync batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rooms {
    /// Rooms the account is joined to.
    #[serde(default)]
    pub join: BTreeMap<RoomId, JoinedRoom>,
    /// Rooms the account has left.
    #[serde(default)]
    pub leave: BTreeMap<RoomId, LeftRoom>,
}

/// Delta for a joined room.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoinedRoom {
    /// Lazy-load member summary.
    #[serde(default)]
    pub summary: LazyLoadSummary,
    /// State preceding the timeline.
    #[serde(default)]
    pub state: EventList<RawEvent>,
    /// New timeline events.
    #[serde(default)]
    pub timeline: Timeline,
    /// Typing and receipts.
    #[serde(default)]
    pub ephemeral: EventList<EphemeralEvent>,
    /// Per-room account data.
    #[serde(default)]
    pub account_data: EventList<AccountDataEvent>,
}

/// Delta for a left room.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeftRoom {
    /// Final state.
    #[serde(default)]
    pub state: EventList<RawEvent>,
    /// Final timeline.
    #[serde(default)]
    pub timeline: Timeline,
}

/// Timeline section of a room delta.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Timeline {
    /// Events, oldest first.
    #[serde(default)]
    pub events: Vec<RawEvent>,
    /// History between the previous batch and these events was skipped.
    #[serde(default)]
    pub limited: bool,
    /// Token for fetching history before `events`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

/// Users whose device lists changed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceLists {
    /// Users with new or removed devices.
    #[serde(default)]
    pub changed: Vec<UserId>,
    /// Users no longer sharing a room with us.
    #[serde(default)]
    pub left: Vec<UserId>,
}

/// Non-persistent per-room signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralEvent {
    /// Event type (`m.typing`, `m.receipt`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Content.
    #[serde(default)]
    pub content: Value,
}

/// Device message addressed to this account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Sending user.
    pub sender: UserId,
    /// Content.
    #[serde(default)]
    pub content: Value,
}

/// Account data event, global or per-room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDataEvent {
    /// Account data type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Content.
    #[serde(default)]
    pub content: Value,
}

//! The per-room aggregate and its component types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ContentUri, EventRowId, RoomId, UserId};

/// Sorting timestamp of a room that has not seen any real event yet.
///
/// Sorts before every real origin timestamp.
pub const SORTING_TIMESTAMP_UNSET: i64 = 0;

/// How authoritative a room's current name is.
///
/// Ordered: a higher quality name is never replaced by a lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameQuality {
    /// No name computed yet.
    #[default]
    Nil,
    /// Generated from member names.
    Participants,
    /// Taken from the canonical alias.
    CanonicalAlias,
    /// Set explicitly with `m.room.name`.
    Explicit,
}

/// Unread counters of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnreadCounts {
    /// Counted messages.
    pub messages: u32,
    /// Messages that notify.
    pub notifications: u32,
    /// Messages that highlight.
    pub highlights: u32,
    /// Notifications that play a sound.
    pub sounds: u32,
}

impl UnreadCounts {
    /// Account for one event with the given classification.
    pub fn add_one(&mut self, unread_type: crate::UnreadType) {
        use crate::UnreadType;
        if unread_type.is(UnreadType::NORMAL) {
            self.messages += 1;
        }
        if unread_type.is(UnreadType::NOTIFY) {
            self.notifications += 1;
        }
        if unread_type.is(UnreadType::HIGHLIGHT) {
            self.highlights += 1;
        }
        if unread_type.is(UnreadType::SOUND) {
            self.sounds += 1;
        }
    }

    /// Component-wise sum.
    pub fn add(&mut self, other: &UnreadCounts) {
        self.messages += other.messages;
        self.notifications += other.notifications;
        self.highlights += other.highlights;
        self.sounds += other.sounds;
    }

    /// True if every counter is zero.
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Server-provided member summary under lazy loading.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LazyLoadSummary {
    /// Members suggested for naming the room.
    #[serde(rename = "m.heroes", default, skip_serializing_if = "Option::is_none")]
    pub heroes: Option<Vec<UserId>>,
    /// Joined member count.
    #[serde(
        rename = "m.joined_member_count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub joined_member_count: Option<u32>,
    /// Invited member count.
    #[serde(
        rename = "m.invited_member_count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub invited_member_count: Option<u32>,
}

impl LazyLoadSummary {
    /// True if the server sent neither heroes nor counts.
    pub fn is_empty(&self) -> bool {
        self.heroes.is_none()
            && self.joined_member_count.is_none()
            && self.invited_member_count.is_none()
    }

    /// Member count used for naming: joined if known and nonzero, else invited.
    pub fn member_count(&self) -> u32 {
        match self.joined_member_count {
            Some(joined) if joined > 0 => joined,
            _ => self.invited_member_count.unwrap_or(0),
        }
    }
}

/// Encryption descriptor from `m.room.encryption`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContent {
    /// Encryption algorithm identifier.
    pub algorithm: String,
    /// Session rotation period in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    /// Session rotation period in messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
}

/// Successor pointer from `m.room.tombstone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneContent {
    /// Human-readable reason.
    #[serde(default)]
    pub body: String,
    /// The replacement room.
    pub replacement_room: RoomId,
}

/// The mutable per-room aggregate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Room {
    /// Room id.
    pub id: RoomId,
    /// Creation content, from `m.room.create`.
    pub creation_content: Option<Value>,
    /// Successor room, from `m.room.tombstone`.
    pub tombstone: Option<TombstoneContent>,
    /// Display name.
    pub name: Option<String>,
    /// How authoritative `name` is.
    pub name_quality: NameQuality,
    /// Avatar.
    pub avatar: Option<ContentUri>,
    /// True once `m.room.avatar` has been seen.
    pub explicit_avatar: bool,
    /// Topic.
    pub topic: Option<String>,
    /// Canonical alias.
    pub canonical_alias: Option<String>,
    /// Stored lazy-load summary.
    pub lazy_load_summary: Option<LazyLoadSummary>,
    /// Encryption descriptor.
    pub encryption: Option<EncryptionContent>,
    /// Token for fetching older history.
    pub prev_batch: Option<String>,
    /// Room list ordering key.
    pub sorting_timestamp: i64,
    /// Unread counters.
    pub unreads: UnreadCounts,
    /// Event shown as the room list preview.
    pub preview_event: Option<EventRowId>,
    /// Manually marked unread.
    pub marked_unread: bool,
}

impl Room {
    /// A freshly materialized room with sentinel ordering.
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            sorting_timestamp: SORTING_TIMESTAMP_UNSET,
            ..Self::default()
        }
    }
}

//! Room aggregate updates and structural diffing.
//!
//! Reconciliation mutates a working copy of the stored [`Room`]; the
//! functions here hold the pure rules for those mutations, and
//! [`diff_rooms`] decides whether the result needs to be written back.

use larch_sync_types::{
    ContentUri, EncryptionContent, Event, EventKind, LazyLoadSummary, NameQuality, Room,
    TombstoneContent, TypesError,
};
use serde::Deserialize;
use serde_json::Value;

/// A tracked room field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomField {
    /// `m.room.create` content.
    CreationContent,
    /// Tombstone.
    Tombstone,
    /// Display name.
    Name,
    /// Name quality.
    NameQuality,
    /// Avatar.
    Avatar,
    /// Explicit-avatar flag.
    ExplicitAvatar,
    /// Topic.
    Topic,
    /// Canonical alias.
    CanonicalAlias,
    /// Stored lazy-load summary.
    LazyLoadSummary,
    /// Encryption descriptor.
    Encryption,
    /// Pagination token.
    PrevBatch,
    /// Sorting timestamp.
    SortingTimestamp,
    /// Unread counters.
    Unreads,
    /// Preview event pointer.
    PreviewEvent,
    /// Marked-unread flag.
    MarkedUnread,
}

/// Fields that differ between two snapshots of the same room.
pub fn diff_rooms(before: &Room, after: &Room) -> Vec<RoomField> {
    let mut changed = Vec::new();
    let mut check = |differs: bool, field: RoomField| {
        if differs {
            changed.push(field);
        }
    };
    check(before.creation_content != after.creation_content, RoomField::CreationContent);
    check(before.tombstone != after.tombstone, RoomField::Tombstone);
    check(before.name != after.name, RoomField::Name);
    check(before.name_quality != after.name_quality, RoomField::NameQuality);
    check(before.avatar != after.avatar, RoomField::Avatar);
    check(before.explicit_avatar != after.explicit_avatar, RoomField::ExplicitAvatar);
    check(before.topic != after.topic, RoomField::Topic);
    check(before.canonical_alias != after.canonical_alias, RoomField::CanonicalAlias);
    check(before.lazy_load_summary != after.lazy_load_summary, RoomField::LazyLoadSummary);
    check(before.encryption != after.encryption, RoomField::Encryption);
    check(before.prev_batch != after.prev_batch, RoomField::PrevBatch);
    check(before.sorting_timestamp != after.sorting_timestamp, RoomField::SortingTimestamp);
    check(before.unreads != after.unreads, RoomField::Unreads);
    check(before.preview_event != after.preview_event, RoomField::PreviewEvent);
    check(before.marked_unread != after.marked_unread, RoomField::MarkedUnread);
    changed
}

/// Outcome of comparing an incoming lazy-load summary with the stored one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryUpdate {
    /// Summary to use for naming in this batch.
    pub effective: Option<LazyLoadSummary>,
    /// The hero set or counts changed and the new summary must be stored.
    pub heroes_changed: bool,
}

/// Compare an incoming summary with the stored one.
///
/// An incoming summary with no heroes and no counts means "unchanged".
pub fn reconcile_summary(stored: Option<&LazyLoadSummary>, incoming: &LazyLoadSummary) -> SummaryUpdate {
    if incoming.is_empty() {
        return SummaryUpdate {
            effective: stored.cloned(),
            heroes_changed: false,
        };
    }
    SummaryUpdate {
        effective: Some(incoming.clone()),
        heroes_changed: stored != Some(incoming),
    }
}

/// Move the sorting timestamp forward for bump-eligible events.
pub fn bump_sorting_timestamp(room: &mut Room, event: &Event) {
    if event.bumps_sorting_timestamp() && event.timestamp > room.sorting_timestamp {
        room.sorting_timestamp = event.timestamp;
    }
}

#[derive(Deserialize)]
struct NameContent {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct CanonicalAliasContent {
    #[serde(default)]
    alias: Option<String>,
}

#[derive(Deserialize)]
struct AvatarContent {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct TopicContent {
    #[serde(default)]
    topic: String,
}

fn parse<T: for<'de> Deserialize<'de>>(event_type: &str, content: &Value) -> Result<T, TypesError> {
    T::deserialize(content).map_err(|source| TypesError::MalformedContent {
        event_type: event_type.to_string(),
        source,
    })
}

/// Apply a root state event to the working copy of a room.
///
/// `snapshot` is the room as stored before this batch; the encryption
/// descriptor only changes when the snapshot had none or the algorithm
/// matches. Events with a non-empty state key and kinds that carry no room
/// metadata are ignored.
pub fn apply_state_event(
    snapshot: &Room,
    room: &mut Room,
    event_type: &str,
    state_key: &str,
    content: &Value,
) -> Result<(), TypesError> {
    let kind = EventKind::from_type(event_type);
    if !state_key.is_empty() || !kind.is_room_metadata() {
        return Ok(());
    }
    match kind {
        EventKind::Create => {
            room.creation_content = Some(content.clone());
        }
        EventKind::Tombstone => {
            room.tombstone = Some(parse::<TombstoneContent>(event_type, content)?);
        }
        EventKind::Encryption => {
            let encryption: EncryptionContent = parse(event_type, content)?;
            let sticky = snapshot
                .encryption
                .as_ref()
                .is_some_and(|existing| existing.algorithm != encryption.algorithm);
            if !sticky {
                room.encryption = Some(encryption);
            }
        }
        EventKind::RoomName => {
            let NameContent { name } = parse(event_type, content)?;
            if !name.is_empty() {
                room.name = Some(name);
                room.name_quality = NameQuality::Explicit;
            } else if let Some(alias) = room.canonical_alias.clone().filter(|a| !a.is_empty()) {
                room.name = Some(alias);
                room.name_quality = NameQuality::CanonicalAlias;
            } else {
                room.name = Some(name);
                room.name_quality = NameQuality::Nil;
            }
        }
        EventKind::CanonicalAlias => {
            let CanonicalAliasContent { alias } = parse(event_type, content)?;
            let alias = alias.unwrap_or_default();
            room.canonical_alias = Some(alias.clone());
            if room.name_quality <= NameQuality::CanonicalAlias {
                room.name_quality = if alias.is_empty() {
                    NameQuality::Nil
                } else {
                    NameQuality::CanonicalAlias
                };
                room.name = Some(alias);
            }
        }
        EventKind::RoomAvatar => {
            let AvatarContent { url } = parse(event_type, content)?;
            room.avatar = url.as_deref().and_then(ContentUri::parse_or_ignore);
            room.explicit_avatar = true;
        }
        EventKind::Topic => {
            let TopicContent { topic } = parse(event_type, content)?;
            room.topic = Some(topic);
        }
        _ => {}
    }
    Ok(())
}

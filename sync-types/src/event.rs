//! Events as delivered by the server and as persisted locally.
//!
//! [`RawEvent`] is the decoded wire shape. [`Event`] is the persisted row:
//! append-only once stored, with a small set of mutable derived fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EventId, EventRowId, RoomId, SessionId, UserId};

/// Event type strings this engine understands.
pub mod event_type {
    /// Plain room message.
    pub const MESSAGE: &str = "m.room.message";
    /// Sticker message.
    pub const STICKER: &str = "m.sticker";
    /// Megolm-encrypted room event.
    pub const ENCRYPTED: &str = "m.room.encrypted";
    /// Redaction of another event.
    pub const REDACTION: &str = "m.room.redaction";
    /// Annotation (emoji reaction).
    pub const REACTION: &str = "m.reaction";
    /// Room creation state.
    pub const CREATE: &str = "m.room.create";
    /// Room upgrade tombstone state.
    pub const TOMBSTONE: &str = "m.room.tombstone";
    /// Explicit room name state.
    pub const ROOM_NAME: &str = "m.room.name";
    /// Canonical alias state.
    pub const CANONICAL_ALIAS: &str = "m.room.canonical_alias";
    /// Room avatar state.
    pub const ROOM_AVATAR: &str = "m.room.avatar";
    /// Room topic state.
    pub const TOPIC: &str = "m.room.topic";
    /// Encryption descriptor state.
    pub const ENCRYPTION: &str = "m.room.encryption";
    /// Membership state.
    pub const MEMBER: &str = "m.room.member";
    /// Service members excluded from generated room names.
    pub const FUNCTIONAL_MEMBERS: &str = "io.element.functional_members";
    /// Ephemeral read receipts.
    pub const RECEIPT: &str = "m.receipt";
    /// Ephemeral typing notifications.
    pub const TYPING: &str = "m.typing";
    /// Account data: push rules.
    pub const PUSH_RULES: &str = "m.push_rules";
    /// Room account data: marked unread.
    pub const MARKED_UNREAD: &str = "m.marked_unread";
    /// Room account data: marked unread, unstable prefix.
    pub const MARKED_UNREAD_UNSTABLE: &str = "com.famedly.marked_unread";
    /// To-device: olm-encrypted payload.
    pub const TO_DEVICE_ENCRYPTED: &str = "m.room.encrypted";
    /// To-device: room key withheld notice.
    pub const ROOM_KEY_WITHHELD: &str = "m.room_key.withheld";
    /// To-device: room key request.
    pub const ROOM_KEY_REQUEST: &str = "m.room_key_request";
    /// To-device: secret request.
    pub const SECRET_REQUEST: &str = "m.secret.request";
}

/// Closed enumeration of the event kinds the engine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `m.room.message`
    Message,
    /// `m.sticker`
    Sticker,
    /// `m.room.encrypted`
    Encrypted,
    /// `m.room.redaction`
    Redaction,
    /// `m.reaction`
    Reaction,
    /// `m.room.create`
    Create,
    /// `m.room.tombstone`
    Tombstone,
    /// `m.room.name`
    RoomName,
    /// `m.room.canonical_alias`
    CanonicalAlias,
    /// `m.room.avatar`
    RoomAvatar,
    /// `m.room.topic`
    Topic,
    /// `m.room.encryption`
    Encryption,
    /// `m.room.member`
    Member,
    /// `io.element.functional_members`
    FunctionalMembers,
    /// Anything else; stored but not interpreted.
    Other,
}

impl EventKind {
    /// Classify an event type string.
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            event_type::MESSAGE => Self::Message,
            event_type::STICKER => Self::Sticker,
            event_type::ENCRYPTED => Self::Encrypted,
            event_type::REDACTION => Self::Redaction,
            event_type::REACTION => Self::Reaction,
            event_type::CREATE => Self::Create,
            event_type::TOMBSTONE => Self::Tombstone,
            event_type::ROOM_NAME => Self::RoomName,
            event_type::CANONICAL_ALIAS => Self::CanonicalAlias,
            event_type::ROOM_AVATAR => Self::RoomAvatar,
            event_type::TOPIC => Self::Topic,
            event_type::ENCRYPTION => Self::Encryption,
            event_type::MEMBER => Self::Member,
            event_type::FUNCTIONAL_MEMBERS => Self::FunctionalMembers,
            _ => Self::Other,
        }
    }

    /// True for kinds whose root-state-key event feeds the room aggregate.
    pub fn is_room_metadata(&self) -> bool {
        matches!(
            self,
            Self::Create
                | Self::Tombstone
                | Self::RoomName
                | Self::CanonicalAlias
                | Self::RoomAvatar
                | Self::Topic
                | Self::Encryption
        )
    }
}

/// Relationship of an event to an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationType {
    /// An edit.
    #[serde(rename = "m.replace")]
    Replace,
    /// A reaction.
    #[serde(rename = "m.annotation")]
    Annotation,
    /// A thread reply.
    #[serde(rename = "m.thread")]
    Thread,
    /// A generic reference.
    #[serde(rename = "m.reference")]
    Reference,
    /// Any relation type this engine does not interpret.
    #[serde(other)]
    Unknown,
}

impl RelationType {
    /// Parse a `rel_type` string.
    pub fn from_rel_type(rel_type: &str) -> Self {
        match rel_type {
            "m.replace" => Self::Replace,
            "m.annotation" => Self::Annotation,
            "m.thread" => Self::Thread,
            "m.reference" => Self::Reference,
            _ => Self::Unknown,
        }
    }
}

/// Membership state of a room member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    /// Currently joined.
    Join,
    /// Invited, not yet joined.
    Invite,
    /// Left or was kicked.
    Leave,
    /// Banned.
    Ban,
    /// Knocking.
    Knock,
}

impl Membership {
    /// Parse a `membership` content value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "join" => Some(Self::Join),
            "invite" => Some(Self::Invite),
            "leave" => Some(Self::Leave),
            "ban" => Some(Self::Ban),
            "knock" => Some(Self::Knock),
            _ => None,
        }
    }

    /// True for members that count as present in the room.
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Join | Self::Invite)
    }
}

/// Unsigned (server-added, unsigned) event metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Unsigned {
    /// Client transaction id, present on echoes of our own sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// The redaction that removed this event's content, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_because: Option<Value>,
}

/// An event as delivered by the server in a sync batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Server-assigned event id.
    pub event_id: EventId,
    /// Declared event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Author of the event.
    pub sender: UserId,
    /// Origin server timestamp (ms since epoch).
    #[serde(default)]
    pub origin_server_ts: i64,
    /// State key, present only on state events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Event content.
    #[serde(default)]
    pub content: Value,
    /// Top-level redaction target (older room versions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<EventId>,
    /// Unsigned metadata.
    #[serde(default)]
    pub unsigned: Unsigned,
}

impl RawEvent {
    /// Classify the declared type.
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Relation declared in `m.relates_to`, excluding plain replies.
    pub fn relation(&self) -> Option<(RelationType, EventId)> {
        let relates_to = self.content.get("m.relates_to")?;
        let rel_type = relates_to.get("rel_type")?.as_str()?;
        let event_id = relates_to.get("event_id")?.as_str()?;
        Some((RelationType::from_rel_type(rel_type), EventId::new(event_id)))
    }

    /// Event id this event replies to, if any.
    pub fn reply_to(&self) -> Option<EventId> {
        self.content
            .get("m.relates_to")?
            .get("m.in_reply_to")?
            .get("event_id")?
            .as_str()
            .map(EventId::new)
    }

    /// Megolm session id of an encrypted event.
    pub fn megolm_session_id(&self) -> Option<SessionId> {
        if self.kind() != EventKind::Encrypted {
            return None;
        }
        self.content
            .get("session_id")?
            .as_str()
            .map(SessionId::new)
    }

    /// Megolm ciphertext of an encrypted event.
    pub fn ciphertext(&self) -> Option<&str> {
        self.content.get("ciphertext")?.as_str()
    }

    /// Id of the redaction that removed this event's content, if any.
    pub fn redacted_by(&self) -> Option<EventId> {
        self.unsigned
            .redacted_because
            .as_ref()?
            .get("event_id")?
            .as_str()
            .map(EventId::new)
    }
}

/// Unread classification of an event, as a small flag set.
///
/// The empty set means "not unread".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnreadType(u8);

impl UnreadType {
    /// Not counted.
    pub const NONE: Self = Self(0);
    /// Counted as unread, no notification.
    pub const NORMAL: Self = Self(0b0001);
    /// Produces a notification.
    pub const NOTIFY: Self = Self(0b0010);
    /// Highlights (mentions, keywords).
    pub const HIGHLIGHT: Self = Self(0b0100);
    /// Notification plays a sound.
    pub const SOUND: Self = Self(0b1000);

    /// Raw flag bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// True if every flag in `other` is set.
    pub fn is(&self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// True if no flag is set.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for UnreadType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for UnreadType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for UnreadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnreadType({:#06b})", self.0)
    }
}

/// Derived rendering data for a message, stamped with the sanitizer version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalContent {
    /// Sanitized, linkified HTML ready for display.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sanitized_html: String,
    /// Sanitizer version that produced this entry.
    pub html_version: u32,
    /// The message had no HTML body.
    #[serde(default)]
    pub was_plaintext: bool,
    /// The message is a short emoji-only message.
    #[serde(default)]
    pub big_emoji: bool,
    /// The sanitized HTML contains math markup.
    #[serde(default)]
    pub has_math: bool,
    /// Editable markdown reconstruction of the message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub edit_source: String,
}

/// A persisted event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Local row id (zero until persisted).
    pub row_id: EventRowId,
    /// Room the event belongs to.
    pub room_id: RoomId,
    /// Server-assigned event id.
    pub event_id: EventId,
    /// Author of the event.
    pub sender: UserId,
    /// Declared (outer) event type.
    pub event_type: String,
    /// State key, present only on state events.
    pub state_key: Option<String>,
    /// Origin server timestamp (ms since epoch).
    pub timestamp: i64,
    /// Raw content as received.
    pub content: Value,
    /// Content used for local derivation (reply fallback removed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripped_content: Option<Value>,
    /// Decrypted content, for encrypted events.
    pub decrypted: Option<Value>,
    /// Decrypted inner event type, for encrypted events.
    pub decrypted_type: Option<String>,
    /// Client transaction id of our own echoes.
    pub transaction_id: Option<String>,
    /// Redaction that removed this event's content.
    pub redacted_by: Option<EventId>,
    /// Target of the event's relation.
    pub relates_to: Option<EventId>,
    /// Kind of the event's relation.
    pub relation_type: Option<RelationType>,
    /// Megolm session of an encrypted event.
    pub megolm_session_id: Option<SessionId>,
    /// Why decryption failed, if it did.
    pub decryption_error: Option<String>,
    /// Unread classification.
    pub unread_type: UnreadType,
    /// Derived rendering data.
    pub local_content: Option<LocalContent>,
}

impl Event {
    /// Build an unpersisted row from a server event.
    pub fn from_raw(room_id: &RoomId, raw: &RawEvent) -> Self {
        let (relation_type, relates_to) = match raw.relation() {
            Some((rel_type, target)) => (Some(rel_type), Some(target)),
            None => (None, None),
        };
        Self {
            row_id: EventRowId::default(),
            room_id: room_id.clone(),
            event_id: raw.event_id.clone(),
            sender: raw.sender.clone(),
            event_type: raw.event_type.clone(),
            state_key: raw.state_key.clone(),
            timestamp: raw.origin_server_ts,
            content: raw.content.clone(),
            stripped_content: None,
            decrypted: None,
            decrypted_type: None,
            transaction_id: raw.unsigned.transaction_id.clone(),
            redacted_by: raw.redacted_by(),
            relates_to,
            relation_type,
            megolm_session_id: raw.megolm_session_id(),
            decryption_error: None,
            unread_type: UnreadType::NONE,
            local_content: None,
        }
    }

    /// The inner type for decrypted events, otherwise the declared type.
    pub fn effective_type(&self) -> &str {
        self.decrypted_type.as_deref().unwrap_or(&self.event_type)
    }

    /// Kind of the effective type.
    pub fn effective_kind(&self) -> EventKind {
        EventKind::from_type(self.effective_type())
    }

    /// Content used for derivation: stripped, else decrypted, else raw.
    ///
    /// The stripped copy is made from the decrypted content when there is one.
    pub fn effective_content(&self) -> &Value {
        self.stripped_content
            .as_ref()
            .or(self.decrypted.as_ref())
            .unwrap_or(&self.content)
    }

    fn is_edit(&self) -> bool {
        self.relation_type == Some(RelationType::Replace)
    }

    fn is_message_like(&self) -> bool {
        match EventKind::from_type(&self.event_type) {
            EventKind::Message | EventKind::Sticker => true,
            EventKind::Encrypted => matches!(
                self.decrypted_type.as_deref().map(EventKind::from_type),
                Some(EventKind::Message) | Some(EventKind::Sticker)
            ),
            _ => false,
        }
    }

    /// True if the event may be shown as the room list preview.
    pub fn can_use_for_preview(&self) -> bool {
        self.is_message_like() && !self.is_edit() && self.redacted_by.is_none()
    }

    /// True if the event moves the room's sorting timestamp forward.
    pub fn bumps_sorting_timestamp(&self) -> bool {
        let kind = EventKind::from_type(&self.event_type);
        matches!(
            kind,
            EventKind::Message | EventKind::Sticker | EventKind::Encrypted
        ) && !self.is_edit()
    }

    /// Unread classification before push rules are applied.
    pub fn non_push_unread_type(&self) -> UnreadType {
        if self.is_edit() || self.redacted_by.is_some() || !self.is_message_like() {
            UnreadType::NONE
        } else {
            UnreadType::NORMAL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_type: &str, content: Value) -> RawEvent {
        RawEvent {
            event_id: EventId::new("$e"),
            event_type: event_type.to_string(),
            sender: UserId::new("@a:x"),
            origin_server_ts: 1_700_000_000_000,
            state_key: None,
            content,
            redacts: None,
            unsigned: Unsigned::default(),
        }
    }

    #[test]
    fn kind_classification() {
        assert_eq!(EventKind::from_type("m.room.message"), EventKind::Message);
        assert_eq!(EventKind::from_type("m.room.name"), EventKind::RoomName);
        assert_eq!(EventKind::from_type("com.example.custom"), EventKind::Other);
        assert!(EventKind::Topic.is_room_metadata());
        assert!(!EventKind::Member.is_room_metadata());
    }

    #[test]
    fn relation_is_extracted() {
        let evt = raw(
            event_type::REACTION,
            json!({"m.relates_to": {"rel_type": "m.annotation", "event_id": "$t", "key": "👍"}}),
        );
        let row = Event::from_raw(&RoomId::new("!r:x"), &evt);
        assert_eq!(row.relation_type, Some(RelationType::Annotation));
        assert_eq!(row.relates_to, Some(EventId::new("$t")));
    }

    #[test]
    fn plain_reply_is_not_a_relation() {
        let evt = raw(
            event_type::MESSAGE,
            json!({"body": "hi", "m.relates_to": {"m.in_reply_to": {"event_id": "$p"}}}),
        );
        assert!(evt.relation().is_none());
        assert_eq!(evt.reply_to(), Some(EventId::new("$p")));
    }

    #[test]
    fn redacted_because_sets_redacted_by() {
        let mut evt = raw(event_type::MESSAGE, json!({}));
        evt.unsigned.redacted_because = Some(json!({"event_id": "$red"}));
        let row = Event::from_raw(&RoomId::new("!r:x"), &evt);
        assert_eq!(row.redacted_by, Some(EventId::new("$red")));
        assert!(!row.can_use_for_preview());
    }

    #[test]
    fn preview_eligibility() {
        let room = RoomId::new("!r:x");
        let msg = Event::from_raw(&room, &raw(event_type::MESSAGE, json!({"body": "x"})));
        assert!(msg.can_use_for_preview());

        let reaction = Event::from_raw(&room, &raw(event_type::REACTION, json!({})));
        assert!(!reaction.can_use_for_preview());

        let edit = Event::from_raw(
            &room,
            &raw(
                event_type::MESSAGE,
                json!({"m.relates_to": {"rel_type": "m.replace", "event_id": "$o"}}),
            ),
        );
        assert!(!edit.can_use_for_preview());
        assert!(!edit.bumps_sorting_timestamp());

        let mut encrypted = Event::from_raw(&room, &raw(event_type::ENCRYPTED, json!({})));
        assert!(!encrypted.can_use_for_preview());
        encrypted.decrypted_type = Some(event_type::MESSAGE.to_string());
        assert!(encrypted.can_use_for_preview());
    }

    #[test]
    fn non_push_unread_type_counts_messages_only() {
        let room = RoomId::new("!r:x");
        let msg = Event::from_raw(&room, &raw(event_type::MESSAGE, json!({"body": "x"})));
        assert_eq!(msg.non_push_unread_type(), UnreadType::NORMAL);
        let member = Event::from_raw(&room, &raw(event_type::MEMBER, json!({})));
        assert_eq!(member.non_push_unread_type(), UnreadType::NONE);
    }

    #[test]
    fn unread_type_flags() {
        let t = UnreadType::NORMAL | UnreadType::NOTIFY | UnreadType::SOUND;
        assert!(t.is(UnreadType::NOTIFY));
        assert!(t.is(UnreadType::SOUND));
        assert!(!t.is(UnreadType::HIGHLIGHT));
        assert!(!t.is(UnreadType::NONE));
        assert!(UnreadType::NONE.is_none());
    }

    #[test]
    fn megolm_session_only_for_encrypted() {
        let evt = raw(event_type::ENCRYPTED, json!({"session_id": "sess", "ciphertext": "AwgA"}));
        assert_eq!(evt.megolm_session_id(), Some(SessionId::new("sess")));
        assert_eq!(evt.ciphertext(), Some("AwgA"));
        let msg = raw(event_type::MESSAGE, json!({"session_id": "sess"}));
        assert!(msg.megolm_session_id().is_none());
    }
}

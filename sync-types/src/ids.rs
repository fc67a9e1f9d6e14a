//! Identity and ordering types for Larch.
//!
//! Server-assigned identifiers are opaque strings wrapped in newtypes so a
//! room id can never be passed where an event id is expected. Row ids are
//! assigned by the local store and are never reused or renumbered.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::TypesError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier string.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier string.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True if the identifier is the empty string.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// A room identifier (`!opaque:server`).
    RoomId
);
string_id!(
    /// A user identifier (`@localpart:server`).
    UserId
);
string_id!(
    /// A server-assigned event identifier (`$opaque`).
    EventId
);
string_id!(
    /// An end-to-end group session (megolm) identifier.
    SessionId
);

/// Local row id of a persisted event.
///
/// Assigned by the store on first insert. Zero means "not persisted yet".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct EventRowId(i64);

impl EventRowId {
    /// Create a row id with the given value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this row id.
    pub fn value(&self) -> i64 {
        self.0
    }

    /// True if this row id has been assigned by the store.
    pub fn is_set(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EventRowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EventRowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventRowId({})", self.0)
    }
}

/// Position of an entry in a room's timeline sequence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TimelineRowId(i64);

impl TimelineRowId {
    /// Create a timeline row id with the given value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this timeline row id.
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Debug for TimelineRowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimelineRowId({})", self.0)
    }
}

/// A parsed `mxc://server/media_id` content URI.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentUri {
    /// Homeserver that owns the media.
    pub server: String,
    /// Opaque media id on that server.
    pub media_id: String,
}

impl ContentUri {
    /// Parse a content URI string.
    ///
    /// Both components must be non-empty and the media id must not contain
    /// a further path separator.
    pub fn parse(uri: &str) -> Result<Self, TypesError> {
        let rest = uri
            .strip_prefix("mxc://")
            .ok_or_else(|| TypesError::InvalidContentUri(uri.to_string()))?;
        let (server, media_id) = rest
            .split_once('/')
            .ok_or_else(|| TypesError::InvalidContentUri(uri.to_string()))?;
        if server.is_empty() || media_id.is_empty() || media_id.contains('/') {
            return Err(TypesError::InvalidContentUri(uri.to_string()));
        }
        Ok(Self {
            server: server.to_string(),
            media_id: media_id.to_string(),
        })
    }

    /// Parse a content URI, returning `None` for empty or invalid input.
    pub fn parse_or_ignore(uri: &str) -> Option<Self> {
        if uri.is_empty() {
            return None;
        }
        Self::parse(uri).ok()
    }
}

impl fmt::Display for ContentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mxc://{}/{}", self.server, self.media_id)
    }
}

impl fmt::Debug for ContentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentUri({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_compare_by_value() {
        assert_eq!(RoomId::new("!a:x"), RoomId::from("!a:x"));
        assert_ne!(UserId::new("@a:x"), UserId::new("@b:x"));
    }

    #[test]
    fn string_id_serializes_transparently() {
        let id = EventId::new("$abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"$abc\"");
    }

    #[test]
    fn row_id_zero_is_unset() {
        assert!(!EventRowId::default().is_set());
        assert!(EventRowId::new(7).is_set());
    }

    #[test]
    fn content_uri_parses() {
        let uri = ContentUri::parse("mxc://example.org/abcDEF").unwrap();
        assert_eq!(uri.server, "example.org");
        assert_eq!(uri.media_id, "abcDEF");
        assert_eq!(uri.to_string(), "mxc://example.org/abcDEF");
    }

    #[test]
    fn content_uri_rejects_garbage() {
        assert!(ContentUri::parse("https://example.org/a").is_err());
        assert!(ContentUri::parse("mxc://example.org").is_err());
        assert!(ContentUri::parse("mxc:///abc").is_err());
        assert!(ContentUri::parse("mxc://example.org/a/b").is_err());
        assert!(ContentUri::parse_or_ignore("").is_none());
    }
}

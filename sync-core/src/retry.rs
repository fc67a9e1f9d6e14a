//! Decryption retry batching.
//!
//! Undecryptable events are collected per batch into one request per megolm
//! session. The request keeps the lowest ratchet index seen, since that is
//! the oldest message the missing key must be able to decrypt.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use larch_sync_types::{RoomId, SessionId, SessionRequest, UserId};
use thiserror::Error;

/// Megolm message format version.
const MEGOLM_VERSION: u8 = 0x03;
/// Protobuf-style tag of the message index field (field 1, varint).
const MESSAGE_INDEX_TAG: u8 = 0x08;
/// Ciphertext prefix long enough to hold the header.
const HEADER_PREFIX_CHARS: usize = 64;

/// Errors from reading a megolm ciphertext header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MegolmIndexError {
    /// Ciphertext is not valid unpadded base64.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Ciphertext is shorter than the header.
    #[error("ciphertext too short")]
    TooShort,

    /// Unexpected version byte.
    #[error("unsupported megolm version {0:#04x}")]
    BadVersion(u8),

    /// The message index field is missing.
    #[error("message index tag missing")]
    MissingIndexTag,

    /// The varint ran off the end of the buffer.
    #[error("truncated message index")]
    TruncatedIndex,

    /// The index does not fit in 32 bits.
    #[error("message index overflow")]
    Overflow,
}

/// Read the ratchet index from a megolm ciphertext header.
pub fn parse_megolm_message_index(ciphertext: &str) -> Result<u32, MegolmIndexError> {
    let trimmed = ciphertext.trim_end_matches('=');
    let mut prefix_len = trimmed.len().min(HEADER_PREFIX_CHARS);
    if prefix_len < trimmed.len() {
        prefix_len -= prefix_len % 4;
    }
    let prefix = trimmed.get(..prefix_len).ok_or(MegolmIndexError::TooShort)?;
    let decoded = STANDARD_NO_PAD.decode(prefix)?;

    match decoded.as_slice() {
        [] | [_] => Err(MegolmIndexError::TooShort),
        [version, ..] if *version != MEGOLM_VERSION => Err(MegolmIndexError::BadVersion(*version)),
        [_, tag, ..] if *tag != MESSAGE_INDEX_TAG => Err(MegolmIndexError::MissingIndexTag),
        [_, _, rest @ ..] => read_varint(rest),
    }
}

/// Read the ratchet index, falling back to 0 for unparseable headers.
///
/// Index 0 asks for the whole session, which is always sufficient.
pub fn megolm_message_index_or_zero(ciphertext: &str) -> u32 {
    parse_megolm_message_index(ciphertext).unwrap_or(0)
}

fn read_varint(bytes: &[u8]) -> Result<u32, MegolmIndexError> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return u32::try_from(value).map_err(|_| MegolmIndexError::Overflow);
        }
    }
    Err(MegolmIndexError::TruncatedIndex)
}

/// Per-batch map of pending session requests.
#[derive(Debug, Default)]
pub struct DecryptionRetryQueue {
    pending: HashMap<SessionId, SessionRequest>,
}

impl DecryptionRetryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session_id` is needed from `min_index` onwards.
    ///
    /// A second request for the same session keeps the lower index.
    pub fn enqueue(&mut self, session_id: SessionId, room_id: RoomId, sender: UserId, min_index: u32) {
        let request = SessionRequest {
            session_id: session_id.clone(),
            room_id,
            sender,
            min_index,
        };
        self.pending
            .entry(session_id)
            .and_modify(|existing| existing.merge(&request))
            .or_insert(request);
    }

    /// Pending request for a session, if any.
    pub fn get(&self, session_id: &SessionId) -> Option<&SessionRequest> {
        self.pending.get(session_id)
    }

    /// Number of distinct sessions queued.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every queued request, ordered by session id.
    pub fn drain(&mut self) -> Vec<SessionRequest> {
        let mut requests: Vec<SessionRequest> = self.pending.drain().map(|(_, req)| req).collect();
        requests.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(index_varint: &[u8]) -> String {
        let mut bytes = vec![MEGOLM_VERSION, MESSAGE_INDEX_TAG];
        bytes.extend_from_slice(index_varint);
        // pad to a whole number of base64 groups plus ciphertext body
        bytes.extend_from_slice(&[0x12; 30]);
        while bytes.len() % 3 != 0 {
            bytes.push(0);
        }
        STANDARD_NO_PAD.encode(bytes)
    }

    // ===========================================
    // Megolm Header Tests
    // ===========================================

    #[test]
    fn parses_single_byte_index() {
        assert_eq!(parse_megolm_message_index(&header(&[5])), Ok(5));
    }

    #[test]
    fn parses_multi_byte_index() {
        // 300 = 0b1_0010_1100 -> 0xac 0x02
        assert_eq!(parse_megolm_message_index(&header(&[0xac, 0x02])), Ok(300));
    }

    #[test]
    fn long_ciphertext_uses_prefix() {
        let mut ct = header(&[7]);
        ct.push_str(&"A".repeat(400));
        assert_eq!(parse_megolm_message_index(&ct), Ok(7));
    }

    #[test]
    fn rejects_wrong_version() {
        let ct = STANDARD_NO_PAD.encode([0x02, 0x08, 0x01]);
        assert_eq!(
            parse_megolm_message_index(&ct),
            Err(MegolmIndexError::BadVersion(0x02))
        );
    }

    #[test]
    fn rejects_missing_tag() {
        let ct = STANDARD_NO_PAD.encode([0x03, 0x10, 0x01]);
        assert_eq!(
            parse_megolm_message_index(&ct),
            Err(MegolmIndexError::MissingIndexTag)
        );
    }

    #[test]
    fn unparseable_header_yields_zero() {
        assert_eq!(megolm_message_index_or_zero("!!not base64!!"), 0);
        assert_eq!(megolm_message_index_or_zero(""), 0);
        assert_eq!(megolm_message_index_or_zero(&header(&[9])), 9);
    }

    // ===========================================
    // Queue Tests
    // ===========================================

    #[test]
    fn merge_keeps_minimum_index() {
        let mut queue = DecryptionRetryQueue::new();
        let session = SessionId::new("sess");
        queue.enqueue(session.clone(), RoomId::new("!r:x"), UserId::new("@a:x"), 12);
        queue.enqueue(session.clone(), RoomId::new("!r:x"), UserId::new("@a:x"), 3);
        queue.enqueue(session.clone(), RoomId::new("!r:x"), UserId::new("@a:x"), 8);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(&session).map(|r| r.min_index), Some(3));
    }

    #[test]
    fn drain_empties_queue() {
        let mut queue = DecryptionRetryQueue::new();
        queue.enqueue(SessionId::new("b"), RoomId::new("!r:x"), UserId::new("@a:x"), 1);
        queue.enqueue(SessionId::new("a"), RoomId::new("!r:x"), UserId::new("@a:x"), 2);
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].session_id, SessionId::new("a"));
        assert!(queue.is_empty());
    }
}

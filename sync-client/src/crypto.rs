//! End-to-end encryption collaborator.
//!
//! Ingestion never touches key material. It hands encrypted room events and
//! to-device traffic to a [`Crypto`] implementation and records what comes
//! back. [`MockCrypto`] is a scriptable double for tests.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use larch_sync_types::{EventId, RawEvent, RoomId, SessionId, ToDeviceEvent, UserId};

/// Errors from crypto calls that are fatal to the batch.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The crypto store failed.
    #[error("crypto store error: {0}")]
    Store(String),

    /// Any other crypto backend failure.
    #[error("crypto backend error: {0}")]
    Backend(String),
}

/// Why a megolm event could not be decrypted.
///
/// Never fatal: the error text is stored on the event row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptionError {
    /// No inbound group session is known.
    #[error("no session with given ID found")]
    NoSessionFound,

    /// The session is known but starts after the message's index.
    #[error("unknown message index {0}")]
    UnknownMessageIndex(u32),

    /// The sender withheld the session.
    #[error("session withheld: {0}")]
    Withheld(String),

    /// Anything else (bad ciphertext, unsupported algorithm).
    #[error("{0}")]
    Other(String),
}

impl DecryptionError {
    /// True if the key may still arrive and decryption should be retried.
    ///
    /// Withheld sessions count: the sender may share the key later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

/// A successfully decrypted room event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedEvent {
    /// Inner event type.
    pub event_type: String,
    /// Inner event content.
    pub content: Value,
}

/// `m.room_key.withheld` content.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomKeyWithheld {
    /// Encryption algorithm of the withheld session.
    pub algorithm: String,
    /// Room of the withheld session.
    #[serde(default)]
    pub room_id: Option<RoomId>,
    /// Withheld session.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Machine-readable reason.
    pub code: String,
    /// Human-readable reason.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `m.room_key_request` content.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoomKeyRequest {
    /// `request` or `request_cancellation`.
    pub action: String,
    /// Device asking for the key.
    pub requesting_device_id: String,
    /// Request id, unique per device.
    pub request_id: String,
    /// Requested session, absent on cancellations.
    #[serde(default)]
    pub body: Option<Value>,
}

/// `m.secret.request` content.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecretRequest {
    /// `request` or `request_cancellation`.
    pub action: String,
    /// Device asking for the secret.
    pub requesting_device_id: String,
    /// Request id, unique per device.
    pub request_id: String,
    /// Requested secret name, absent on cancellations.
    #[serde(default)]
    pub name: Option<String>,
}

/// Crypto collaborator.
#[async_trait]
pub trait Crypto: Send + Sync {
    /// Decrypt a megolm-encrypted room event.
    async fn decrypt_megolm_event(
        &self,
        room_id: &RoomId,
        event: &RawEvent,
    ) -> Result<DecryptedEvent, DecryptionError>;

    /// Handle an olm-encrypted to-device event (room keys, forwarded keys).
    async fn handle_encrypted_to_device(&self, event: &ToDeviceEvent);

    /// Record a withheld room key.
    async fn handle_room_key_withheld(&self, sender: &UserId, content: &RoomKeyWithheld);

    /// Update the published one-time key counts.
    async fn handle_otk_counts(&self, counts: &HashMap<String, u32>);

    /// Answer a secret request from one of our devices.
    async fn handle_secret_request(&self, sender: &UserId, content: &SecretRequest);

    /// Answer a room key request from one of our devices.
    async fn handle_room_key_request(&self, sender: &UserId, content: &RoomKeyRequest);

    /// Mark the device lists of these users as outdated.
    async fn mark_tracked_users_outdated(&self, users: &[UserId]) -> Result<(), CryptoError>;
}

/// Scriptable [`Crypto`] double.
///
/// Events decrypt only if a result was registered for their event id;
/// everything else fails with [`DecryptionError::NoSessionFound`]. All
/// handler calls are recorded.
#[derive(Debug, Default)]
pub struct MockCrypto {
    inner: Arc<Mutex<MockCryptoInner>>,
}

#[derive(Debug, Default)]
struct MockCryptoInner {
    decryptions: HashMap<EventId, Result<DecryptedEvent, DecryptionError>>,
    decrypt_attempts: Vec<EventId>,
    to_device: Vec<String>,
    withheld: Vec<(UserId, RoomKeyWithheld)>,
    otk_counts: Vec<HashMap<String, u32>>,
    secret_requests: Vec<(UserId, SecretRequest)>,
    room_key_requests: Vec<(UserId, RoomKeyRequest)>,
    outdated_users: Vec<UserId>,
    fail_next_mark_outdated: Option<String>,
}

impl MockCrypto {
    /// Create a mock that cannot decrypt anything.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockCryptoInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `event_id` decrypt to the given type and content.
    pub fn add_decryption(&self, event_id: &str, event_type: &str, content: Value) {
        self.state().decryptions.insert(
            EventId::new(event_id),
            Ok(DecryptedEvent {
                event_type: event_type.to_string(),
                content,
            }),
        );
    }

    /// Make `event_id` fail to decrypt with `error`.
    pub fn fail_decryption(&self, event_id: &str, error: DecryptionError) {
        self.state()
            .decryptions
            .insert(EventId::new(event_id), Err(error));
    }

    /// Cause the next `mark_tracked_users_outdated` to fail.
    pub fn fail_next_mark_outdated(&self, error: &str) {
        self.state().fail_next_mark_outdated = Some(error.to_string());
    }

    /// Event ids passed to `decrypt_megolm_event`, in call order.
    pub fn decrypt_attempts(&self) -> Vec<EventId> {
        self.state().decrypt_attempts.clone()
    }

    /// Types of to-device events handled inline.
    pub fn to_device_handled(&self) -> Vec<String> {
        self.state().to_device.clone()
    }

    /// Withheld notices received.
    pub fn withheld(&self) -> Vec<(UserId, RoomKeyWithheld)> {
        self.state().withheld.clone()
    }

    /// One-time key count updates received.
    pub fn otk_counts(&self) -> Vec<HashMap<String, u32>> {
        self.state().otk_counts.clone()
    }

    /// Secret requests received.
    pub fn secret_requests(&self) -> Vec<(UserId, SecretRequest)> {
        self.state().secret_requests.clone()
    }

    /// Room key requests received.
    pub fn room_key_requests(&self) -> Vec<(UserId, RoomKeyRequest)> {
        self.state().room_key_requests.clone()
    }

    /// Users marked outdated so far.
    pub fn outdated_users(&self) -> Vec<UserId> {
        self.state().outdated_users.clone()
    }
}

impl Clone for MockCrypto {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Crypto for MockCrypto {
    async fn decrypt_megolm_event(
        &self,
        _room_id: &RoomId,
        event: &RawEvent,
    ) -> Result<DecryptedEvent, DecryptionError> {
        let mut inner = self.state();
        inner.decrypt_attempts.push(event.event_id.clone());
        inner
            .decryptions
            .get(&event.event_id)
            .cloned()
            .unwrap_or(Err(DecryptionError::NoSessionFound))
    }

    async fn handle_encrypted_to_device(&self, event: &ToDeviceEvent) {
        self.state().to_device.push(event.event_type.clone());
    }

    async fn handle_room_key_withheld(&self, sender: &UserId, content: &RoomKeyWithheld) {
        self.state().withheld.push((sender.clone(), content.clone()));
    }

    async fn handle_otk_counts(&self, counts: &HashMap<String, u32>) {
        self.state().otk_counts.push(counts.clone());
    }

    async fn handle_secret_request(&self, sender: &UserId, content: &SecretRequest) {
        self.state()
            .secret_requests
            .push((sender.clone(), content.clone()));
    }

    async fn handle_room_key_request(&self, sender: &UserId, content: &RoomKeyRequest) {
        self.state()
            .room_key_requests
            .push((sender.clone(), content.clone()));
    }

    async fn mark_tracked_users_outdated(&self, users: &[UserId]) -> Result<(), CryptoError> {
        let mut inner = self.state();
        if let Some(error) = inner.fail_next_mark_outdated.take() {
            return Err(CryptoError::Store(error));
        }
        inner.outdated_users.extend(users.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encrypted(event_id: &str) -> RawEvent {
        serde_json::from_value(json!({
            "event_id": event_id,
            "type": "m.room.encrypted",
            "sender": "@a:x",
            "origin_server_ts": 1,
            "content": {"algorithm": "m.megolm.v1.aes-sha2", "session_id": "s", "ciphertext": "AwgA"}
        }))
        .unwrap()
    }

    #[test]
    fn retryable_errors() {
        assert!(DecryptionError::NoSessionFound.is_retryable());
        assert!(DecryptionError::UnknownMessageIndex(4).is_retryable());
        assert!(DecryptionError::Withheld("m.unverified".into()).is_retryable());
        assert!(!DecryptionError::Other("bad mac".into()).is_retryable());
    }

    #[tokio::test]
    async fn mock_decrypts_registered_events() {
        let crypto = MockCrypto::new();
        crypto.add_decryption("$a", "m.room.message", json!({"body": "hi"}));

        let room = RoomId::new("!r:x");
        let ok = crypto.decrypt_megolm_event(&room, &encrypted("$a")).await.unwrap();
        assert_eq!(ok.event_type, "m.room.message");

        let err = crypto
            .decrypt_megolm_event(&room, &encrypted("$b"))
            .await
            .unwrap_err();
        assert_eq!(err, DecryptionError::NoSessionFound);
        assert_eq!(
            crypto.decrypt_attempts(),
            vec![EventId::new("$a"), EventId::new("$b")]
        );
    }

    #[tokio::test]
    async fn mock_mark_outdated_failure_fires_once() {
        let crypto = MockCrypto::new();
        crypto.fail_next_mark_outdated("db locked");

        let users = [UserId::new("@a:x")];
        assert!(crypto.mark_tracked_users_outdated(&users).await.is_err());
        crypto.mark_tracked_users_outdated(&users).await.unwrap();
        assert_eq!(crypto.outdated_users(), users.to_vec());
    }

    #[test]
    fn withheld_content_parses() {
        let content: RoomKeyWithheld = serde_json::from_value(json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "room_id": "!r:x",
            "session_id": "s",
            "code": "m.unverified"
        }))
        .unwrap();
        assert_eq!(content.code, "m.unverified");
        assert!(content.reason.is_none());
    }
}

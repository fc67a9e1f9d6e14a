//! To-device event routing.
//!
//! Key material must be in place before room events are decrypted, so
//! encrypted and withheld events are handed to the crypto collaborator
//! inline. Key and secret requests are answered later on a detached task.

use larch_sync_types::{event_type, ToDeviceEvent, UserId};

use crate::crypto::{Crypto, RoomKeyRequest, RoomKeyWithheld, SecretRequest};

/// A to-device event left for the background task.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredToDevice {
    /// `m.secret.request`.
    SecretRequest {
        /// Requesting user.
        sender: UserId,
        /// Parsed content.
        content: SecretRequest,
    },
    /// `m.room_key_request`.
    RoomKeyRequest {
        /// Requesting user.
        sender: UserId,
        /// Parsed content.
        content: RoomKeyRequest,
    },
}

/// Handle inline events and return the ones to apply later.
///
/// Malformed events are logged and dropped. Unknown types are ignored.
pub async fn route_to_device(crypto: &dyn Crypto, events: &[ToDeviceEvent]) -> Vec<DeferredToDevice> {
    let mut deferred = Vec::new();
    for event in events {
        if !event.content.is_object() {
            tracing::warn!(
                "Dropping malformed to-device event {} from {}: content is not an object",
                event.event_type,
                event.sender
            );
            continue;
        }
        match event.event_type.as_str() {
            event_type::TO_DEVICE_ENCRYPTED => crypto.handle_encrypted_to_device(event).await,
            event_type::ROOM_KEY_WITHHELD => {
                if let Some(content) = parse::<RoomKeyWithheld>(event) {
                    crypto.handle_room_key_withheld(&event.sender, &content).await;
                }
            }
            event_type::SECRET_REQUEST => {
                if let Some(content) = parse(event) {
                    deferred.push(DeferredToDevice::SecretRequest {
                        sender: event.sender.clone(),
                        content,
                    });
                }
            }
            event_type::ROOM_KEY_REQUEST => {
                if let Some(content) = parse(event) {
                    deferred.push(DeferredToDevice::RoomKeyRequest {
                        sender: event.sender.clone(),
                        content,
                    });
                }
            }
            other => tracing::debug!("Ignoring to-device event {} from {}", other, event.sender),
        }
    }
    deferred
}

/// Apply deferred events. Run on a detached task.
pub async fn apply_deferred(crypto: &dyn Crypto, deferred: Vec<DeferredToDevice>) {
    for event in deferred {
        match event {
            DeferredToDevice::SecretRequest { sender, content } => {
                crypto.handle_secret_request(&sender, &content).await
            }
            DeferredToDevice::RoomKeyRequest { sender, content } => {
                crypto.handle_room_key_request(&sender, &content).await
            }
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(event: &ToDeviceEvent) -> Option<T> {
    match serde_json::from_value(event.content.clone()) {
        Ok(content) => Some(content),
        Err(err) => {
            tracing::warn!(
                "Dropping malformed to-device event {} from {}: {}",
                event.event_type,
                event.sender,
                err
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MockCrypto;
    use serde_json::{json, Value};

    fn to_device(event_type: &str, content: Value) -> ToDeviceEvent {
        ToDeviceEvent {
            event_type: event_type.to_string(),
            sender: UserId::new("@me:x"),
            content,
        }
    }

    #[tokio::test]
    async fn encrypted_and_withheld_are_inline() {
        let crypto = MockCrypto::new();
        let events = [
            to_device("m.room.encrypted", json!({"algorithm": "m.olm.v1", "ciphertext": {}})),
            to_device(
                "m.room_key.withheld",
                json!({"algorithm": "m.megolm.v1.aes-sha2", "code": "m.blacklisted"}),
            ),
        ];

        let deferred = route_to_device(&crypto, &events).await;

        assert!(deferred.is_empty());
        assert_eq!(crypto.to_device_handled(), vec!["m.room.encrypted".to_string()]);
        assert_eq!(crypto.withheld().len(), 1);
    }

    #[tokio::test]
    async fn requests_are_deferred() {
        let crypto = MockCrypto::new();
        let events = [
            to_device(
                "m.secret.request",
                json!({"action": "request", "requesting_device_id": "D", "request_id": "1", "name": "m.megolm_backup.v1"}),
            ),
            to_device(
                "m.room_key_request",
                json!({"action": "request_cancellation", "requesting_device_id": "D", "request_id": "2"}),
            ),
        ];

        let deferred = route_to_device(&crypto, &events).await;
        assert_eq!(deferred.len(), 2);
        assert!(crypto.secret_requests().is_empty());

        apply_deferred(&crypto, deferred).await;
        assert_eq!(crypto.secret_requests().len(), 1);
        assert_eq!(crypto.room_key_requests().len(), 1);
    }

    #[tokio::test]
    async fn malformed_events_are_dropped() {
        let crypto = MockCrypto::new();
        let events = [
            to_device("m.room.encrypted", json!("not an object")),
            to_device("m.room_key.withheld", json!({"code": 5})),
            to_device("m.secret.request", json!({"action": "request"})),
        ];

        let deferred = route_to_device(&crypto, &events).await;

        assert!(deferred.is_empty());
        assert!(crypto.to_device_handled().is_empty());
        assert!(crypto.withheld().is_empty());
    }

    #[tokio::test]
    async fn unknown_types_are_ignored() {
        let crypto = MockCrypto::new();
        let events = [to_device("m.dummy", json!({}))];
        assert!(route_to_device(&crypto, &events).await.is_empty());
    }
}

//! Per-event normalization.
//!
//! Turns one server event into a stored [`Event`] row: reply fallback
//! removal, decryption, push classification, local content derivation and
//! media caching. Decryption failures are stored on the row and never fail
//! the batch.

use serde_json::Value;

use larch_sync_core::{
    derive_local_content, megolm_message_index_or_zero, needs_reprocess, strip_reply_fallback,
    DecryptionRetryQueue,
};
use larch_sync_types::{
    event_type, ContentUri, Event, EventId, EventKind, LazyLoadSummary, Media, RawEvent, RoomId,
    SessionRequest,
};

use crate::error::{Result, StoreResultExt};
use crate::ingest::IngestContext;

/// Where retryable decryption failures go.
pub(crate) enum RetrySink<'q> {
    /// Collected and persisted once per room after the timeline.
    Batch(&'q mut DecryptionRetryQueue),
    /// Persisted right away (pagination). Failures are only logged.
    Immediate,
}

/// Result of normalizing one event.
#[derive(Debug)]
pub(crate) struct NormalizedEvent {
    /// The stored row.
    pub event: Event,
    /// False if the event id was already stored.
    pub is_new: bool,
    /// Redaction target, for redaction events.
    pub redacts: Option<EventId>,
}

pub(crate) struct EventNormalizer<'a> {
    ctx: &'a IngestContext<'a>,
}

impl<'a> EventNormalizer<'a> {
    pub fn new(ctx: &'a IngestContext<'a>) -> Self {
        Self { ctx }
    }

    /// Normalize and store one event.
    ///
    /// An event id that is already stored is returned as-is.
    pub async fn process(
        &self,
        room_id: &RoomId,
        raw: &RawEvent,
        summary: Option<&LazyLoadSummary>,
        mut retry: RetrySink<'_>,
    ) -> Result<NormalizedEvent> {
        let ctx = self.ctx;
        if let Some(existing) = ctx
            .store
            .get_event_by_id(&raw.event_id)
            .await
            .with_context(|| format!("failed to check if event {} exists", raw.event_id))?
        {
            return Ok(NormalizedEvent {
                redacts: None,
                event: existing,
                is_new: false,
            });
        }

        let mut raw = raw.clone();
        let redacts = fix_redaction_target(&mut raw);
        let mut event = Event::from_raw(room_id, &raw);

        if raw.kind() == EventKind::Encrypted && event.redacted_by.is_none() {
            match ctx.crypto.decrypt_megolm_event(room_id, &raw).await {
                Ok(decrypted) => {
                    event.decrypted_type = Some(decrypted.event_type);
                    event.decrypted = Some(decrypted.content);
                }
                Err(err) => {
                    event.decryption_error = Some(err.to_string());
                    if err.is_retryable() {
                        if let Some(session_id) = event.megolm_session_id.clone() {
                            let request = SessionRequest {
                                session_id,
                                room_id: room_id.clone(),
                                sender: event.sender.clone(),
                                min_index: raw.ciphertext().map_or(0, megolm_message_index_or_zero),
                            };
                            self.request_session(&mut retry, request).await;
                        }
                    }
                }
            }
        }

        if matches!(event.effective_kind(), EventKind::Message | EventKind::Sticker) {
            let source = event.decrypted.as_ref().unwrap_or(&event.content);
            event.stripped_content = strip_reply_fallback(source);
        }

        if &event.sender != ctx.own_user {
            event.unread_type = ctx
                .push_rules
                .classify(event.non_push_unread_type(), &event, summary);
        }

        let mut inline_images = Vec::new();
        if event.effective_type() == event_type::MESSAGE {
            let own = &event.sender == ctx.own_user;
            if let Some(derived) = derive_local_content(
                event.effective_content(),
                event.relation_type,
                own,
                None,
                ctx.content,
            ) {
                if let Some(err) = &derived.sanitize_error {
                    tracing::warn!("Failed to sanitize HTML in {}: {}", event.event_id, err);
                }
                event.local_content = Some(derived.local_content);
                inline_images = derived.inline_images;
            }
        }

        event.row_id = ctx
            .store
            .upsert_event(&event)
            .await
            .with_context(|| format!("failed to save event {}", event.event_id))?;

        let mut media = media_references(&event);
        media.extend(inline_images.into_iter().map(Media::bare));
        for item in media {
            self.cache_media(&event, item).await;
        }

        Ok(NormalizedEvent {
            event,
            is_new: true,
            redacts,
        })
    }

    /// Recompute local content of a stored message made by an older
    /// sanitizer. Returns the updated row, or `None` if nothing was stale.
    pub async fn reprocess(&self, event: &Event) -> Result<Option<Event>> {
        let ctx = self.ctx;
        if event.effective_type() != event_type::MESSAGE
            || !needs_reprocess(event.local_content.as_ref())
        {
            return Ok(None);
        }
        let own = &event.sender == ctx.own_user;
        let Some(derived) = derive_local_content(
            event.effective_content(),
            event.relation_type,
            own,
            event.local_content.as_ref(),
            ctx.content,
        ) else {
            return Ok(None);
        };
        if let Some(err) = &derived.sanitize_error {
            tracing::warn!("Failed to sanitize HTML in {}: {}", event.event_id, err);
        }

        ctx.store
            .update_local_content(event.row_id, Some(&derived.local_content))
            .await
            .with_context(|| format!("failed to save local content of {}", event.event_id))?;

        let mut updated = event.clone();
        updated.local_content = Some(derived.local_content);
        for uri in derived.inline_images {
            self.cache_media(&updated, Media::bare(uri)).await;
        }
        Ok(Some(updated))
    }

    async fn request_session(&self, retry: &mut RetrySink<'_>, request: SessionRequest) {
        match retry {
            RetrySink::Batch(queue) => queue.enqueue(
                request.session_id,
                request.room_id,
                request.sender,
                request.min_index,
            ),
            RetrySink::Immediate => match self.ctx.store.put_session_request(&request).await {
                Ok(()) => self.ctx.retry_wake.notify_one(),
                Err(err) => tracing::error!(
                    "Failed to save session request for {}: {}",
                    request.session_id,
                    err
                ),
            },
        }
    }

    async fn cache_media(&self, event: &Event, media: Media) {
        let store = self.ctx.store;
        if let Err(err) = store.put_media(&media).await {
            tracing::warn!("Failed to cache media {} of {}: {}", media.uri, event.event_id, err);
            return;
        }
        if let Err(err) = store.add_media_reference(event.row_id, &media.uri).await {
            tracing::warn!(
                "Failed to add media reference {} for {}: {}",
                media.uri,
                event.event_id,
                err
            );
        }
    }
}

/// Make the content `redacts` agree with the top-level one, lifting it to
/// the top level when only the content has it. Returns the target.
fn fix_redaction_target(raw: &mut RawEvent) -> Option<EventId> {
    if raw.kind() != EventKind::Redaction {
        return None;
    }
    let content_redacts = raw
        .content
        .get("redacts")
        .and_then(Value::as_str)
        .map(EventId::new);
    match (raw.redacts.clone(), content_redacts) {
        (Some(top), content) => {
            if content.as_ref() != Some(&top) {
                if let Some(object) = raw.content.as_object_mut() {
                    object.insert("redacts".into(), Value::from(top.as_str()));
                }
            }
            Some(top)
        }
        (None, Some(content)) => {
            raw.redacts = Some(content.clone());
            Some(content)
        }
        (None, None) => None,
    }
}

fn media_references(event: &Event) -> Vec<Media> {
    let content = event.decrypted.as_ref().unwrap_or(&event.content);
    let mut media = Vec::new();
    match event.effective_kind() {
        EventKind::Message | EventKind::Sticker => {
            let info = content.get("info");
            let file_name = content
                .get("filename")
                .or_else(|| content.get("body"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let mime_type = info
                .and_then(|i| i.get("mimetype"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(main) = file_media(content.get("file"), content.get("url")) {
                media.push(Media {
                    file_name,
                    mime_type,
                    ..main
                });
            }
            let thumbnail = info.and_then(|i| {
                file_media(i.get("thumbnail_file"), i.get("thumbnail_url"))
            });
            if let Some(thumbnail) = thumbnail {
                let mime_type = info
                    .and_then(|i| i.get("thumbnail_info"))
                    .and_then(|i| i.get("mimetype"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                media.push(Media {
                    mime_type,
                    ..thumbnail
                });
            }
        }
        EventKind::RoomAvatar => {
            media.extend(uri_field(content, "url").map(Media::bare));
        }
        EventKind::Member => {
            media.extend(uri_field(content, "avatar_url").map(Media::bare));
        }
        _ => {}
    }
    media
}

/// Encrypted file descriptor if present, else the plain URL.
fn file_media(file: Option<&Value>, url: Option<&Value>) -> Option<Media> {
    if let Some(file) = file {
        let uri = file
            .get("url")
            .and_then(Value::as_str)
            .and_then(ContentUri::parse_or_ignore)?;
        return Some(Media {
            encrypted_file: Some(file.clone()),
            ..Media::bare(uri)
        });
    }
    url.and_then(Value::as_str)
        .and_then(ContentUri::parse_or_ignore)
        .map(Media::bare)
}

fn uri_field(content: &Value, field: &str) -> Option<ContentUri> {
    content
        .get(field)
        .and_then(Value::as_str)
        .and_then(ContentUri::parse_or_ignore)
}

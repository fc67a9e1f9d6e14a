//! In-memory store.
//!
//! Implements the full [`Store`] contract with plain collections behind one
//! mutex. Used by tests and by hosts that do not need persistence. Failures
//! can be injected per operation.

use super::{Store, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use larch_sync_types::{
    AccountData, ContentUri, CurrentStateEntry, Event, EventId, EventRowId, LocalContent, Media,
    Membership, Receipt, Room, RoomId, SessionId, SessionRequest, TimelineRowId,
    TimelineRowTuple, UnreadCounts, UserId,
};

/// In-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

type StateKey = (RoomId, String, String);
type ReceiptKey = (RoomId, UserId, String, Option<String>);
type AccountDataKey = (UserId, Option<RoomId>, String);

#[derive(Debug, Default)]
struct MemoryStoreInner {
    events: BTreeMap<EventRowId, Event>,
    event_ids: HashMap<EventId, EventRowId>,
    last_event_row: i64,
    current_state: HashMap<StateKey, CurrentStateEntry>,
    timelines: HashMap<RoomId, Vec<TimelineRowTuple>>,
    last_append_row: i64,
    last_prepend_row: i64,
    rooms: HashMap<RoomId, Room>,
    receipts: HashMap<ReceiptKey, Receipt>,
    account_data: HashMap<AccountDataKey, AccountData>,
    session_requests: HashMap<SessionId, SessionRequest>,
    media: HashMap<ContentUri, Media>,
    media_references: HashSet<(EventRowId, ContentUri)>,
    next_batch: HashMap<UserId, String>,
    room_writes: usize,
    failures: HashMap<&'static str, String>,
}

impl MemoryStoreInner {
    fn check(&mut self, operation: &'static str) -> Result<(), StoreError> {
        match self.failures.remove(operation) {
            Some(error) => Err(StoreError::Backend(error)),
            None => Ok(()),
        }
    }

    fn event_by_id(&self, event_id: &EventId) -> Option<&Event> {
        self.event_ids
            .get(event_id)
            .and_then(|row_id| self.events.get(row_id))
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStoreInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    fn inspect(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cause the next call of `operation` (a [`Store`] method name) to fail.
    pub fn fail_next(&self, operation: &'static str, error: &str) {
        self.inspect().failures.insert(operation, error.to_string());
    }

    /// Event row ids of a room's timeline, oldest first.
    pub fn timeline(&self, room_id: &RoomId) -> Vec<EventRowId> {
        self.inspect()
            .timelines
            .get(room_id)
            .map(|rows| rows.iter().map(|t| t.event_row_id).collect())
            .unwrap_or_default()
    }

    /// Number of stored events.
    pub fn event_count(&self) -> usize {
        self.inspect().events.len()
    }

    /// Number of `upsert_room` calls so far.
    pub fn room_writes(&self) -> usize {
        self.inspect().room_writes
    }

    /// All receipts stored for a room.
    pub fn receipts(&self, room_id: &RoomId) -> Vec<Receipt> {
        let inner = self.inspect();
        let mut receipts: Vec<Receipt> = inner
            .receipts
            .values()
            .filter(|r| &r.room_id == room_id)
            .cloned()
            .collect();
        receipts.sort_by(|a, b| (&a.user_id, &a.receipt_type).cmp(&(&b.user_id, &b.receipt_type)));
        receipts
    }

    /// Cached media row for a URI.
    pub fn media(&self, uri: &ContentUri) -> Option<Media> {
        self.inspect().media.get(uri).cloned()
    }

    /// Content URIs referenced by an event row.
    pub fn media_references(&self, row_id: EventRowId) -> Vec<ContentUri> {
        let mut uris: Vec<ContentUri> = self
            .inspect()
            .media_references
            .iter()
            .filter(|(row, _)| *row == row_id)
            .map(|(_, uri)| uri.clone())
            .collect();
        uris.sort();
        uris
    }

    /// Current state entry for (room, type, state key).
    pub fn current_state_entry(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Option<CurrentStateEntry> {
        self.inspect()
            .current_state
            .get(&(room_id.clone(), event_type.to_string(), state_key.to_string()))
            .cloned()
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_event_by_id(&self, event_id: &EventId) -> Result<Option<Event>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("get_event_by_id")?;
        Ok(inner.event_by_id(event_id).cloned())
    }

    async fn get_event_by_row_id(&self, row_id: EventRowId) -> Result<Option<Event>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("get_event_by_row_id")?;
        Ok(inner.events.get(&row_id).cloned())
    }

    async fn upsert_event(&self, event: &Event) -> Result<EventRowId, StoreError> {
        let mut inner = self.lock()?;
        inner.check("upsert_event")?;

        if let Some(&row_id) = inner.event_ids.get(&event.event_id) {
            if let Some(stored) = inner.events.get_mut(&row_id) {
                stored.decrypted = event.decrypted.clone();
                stored.decrypted_type = event.decrypted_type.clone();
                stored.decryption_error = event.decryption_error.clone();
                stored.stripped_content = event.stripped_content.clone();
                stored.local_content = event.local_content.clone();
                if stored.redacted_by.is_none() {
                    stored.redacted_by = event.redacted_by.clone();
                }
            }
            return Ok(row_id);
        }

        inner.last_event_row += 1;
        let row_id = EventRowId::new(inner.last_event_row);
        let mut stored = event.clone();
        stored.row_id = row_id;
        inner.event_ids.insert(stored.event_id.clone(), row_id);
        inner.events.insert(row_id, stored);
        Ok(row_id)
    }

    async fn update_local_content(
        &self,
        row_id: EventRowId,
        local_content: Option<&LocalContent>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("update_local_content")?;
        let event = inner.events.get_mut(&row_id).ok_or_else(|| StoreError::NotFound {
            what: format!("event row {}", row_id.value()),
        })?;
        event.local_content = local_content.cloned();
        Ok(())
    }

    async fn redact_event(
        &self,
        target: &EventId,
        redaction: &EventId,
    ) -> Result<Option<Event>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("redact_event")?;
        let Some(&row_id) = inner.event_ids.get(target) else {
            return Ok(None);
        };
        Ok(inner.events.get_mut(&row_id).map(|event| {
            event.redacted_by = Some(redaction.clone());
            event.clone()
        }))
    }

    async fn set_current_state(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        row_id: EventRowId,
        membership: Option<Membership>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("set_current_state")?;
        inner.current_state.insert(
            (room_id.clone(), event_type.to_string(), state_key.to_string()),
            CurrentStateEntry {
                event_type: event_type.to_string(),
                state_key: state_key.to_string(),
                event_row_id: row_id,
                membership,
            },
        );
        Ok(())
    }

    async fn get_current_state(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Event>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("get_current_state")?;
        let key = (room_id.clone(), event_type.to_string(), state_key.to_string());
        Ok(inner
            .current_state
            .get(&key)
            .and_then(|entry| inner.events.get(&entry.event_row_id))
            .cloned())
    }

    async fn append_timeline(
        &self,
        room_id: &RoomId,
        rows: &[EventRowId],
    ) -> Result<Vec<TimelineRowTuple>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("append_timeline")?;
        let mut present: HashSet<EventRowId> = inner
            .timelines
            .get(room_id)
            .map(|t| t.iter().map(|tuple| tuple.event_row_id).collect())
            .unwrap_or_default();

        let mut added = Vec::new();
        for &row_id in rows {
            if !present.insert(row_id) {
                continue;
            }
            inner.last_append_row += 1;
            added.push(TimelineRowTuple {
                timeline_row_id: TimelineRowId::new(inner.last_append_row),
                event_row_id: row_id,
            });
        }
        inner
            .timelines
            .entry(room_id.clone())
            .or_default()
            .extend(added.iter().copied());
        Ok(added)
    }

    async fn prepend_timeline(
        &self,
        room_id: &RoomId,
        rows: &[EventRowId],
    ) -> Result<Vec<TimelineRowTuple>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("prepend_timeline")?;
        let present: HashSet<EventRowId> = inner
            .timelines
            .get(room_id)
            .map(|t| t.iter().map(|tuple| tuple.event_row_id).collect())
            .unwrap_or_default();

        // Prepended rows count down so that row order stays chronological.
        let fresh: Vec<EventRowId> = rows
            .iter()
            .copied()
            .filter(|row| !present.contains(row))
            .collect();
        let mut added = Vec::with_capacity(fresh.len());
        for &row_id in fresh.iter().rev() {
            added.push(TimelineRowTuple {
                timeline_row_id: TimelineRowId::new(inner.last_prepend_row),
                event_row_id: row_id,
            });
            inner.last_prepend_row -= 1;
        }
        added.reverse();

        let timeline = inner.timelines.entry(room_id.clone()).or_default();
        let mut merged = added.clone();
        merged.append(timeline);
        *timeline = merged;
        Ok(added)
    }

    async fn clear_timeline(&self, room_id: &RoomId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("clear_timeline")?;
        inner.timelines.remove(room_id);
        Ok(())
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("get_room")?;
        Ok(inner.rooms.get(room_id).cloned())
    }

    async fn create_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("create_room")?;
        inner
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Room::new(room_id.clone()));
        Ok(())
    }

    async fn upsert_room(&self, room: &Room) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("upsert_room")?;
        inner.room_writes += 1;
        inner.rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("delete_room")?;
        inner.rooms.remove(room_id);
        inner.timelines.remove(room_id);
        inner.current_state.retain(|(room, _, _), _| room != room_id);
        inner.receipts.retain(|(room, _, _, _), _| room != room_id);
        inner
            .account_data
            .retain(|(_, room, _), _| room.as_ref() != Some(room_id));

        let removed: Vec<EventRowId> = inner
            .events
            .iter()
            .filter(|(_, event)| &event.room_id == room_id)
            .map(|(row_id, _)| *row_id)
            .collect();
        for row_id in removed {
            if let Some(event) = inner.events.remove(&row_id) {
                inner.event_ids.remove(&event.event_id);
            }
            inner.media_references.retain(|(row, _)| *row != row_id);
        }
        Ok(())
    }

    async fn recalculate_preview(&self, room_id: &RoomId) -> Result<Option<EventRowId>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("recalculate_preview")?;
        Ok(inner
            .events
            .values()
            .filter(|event| &event.room_id == room_id && event.can_use_for_preview())
            .max_by_key(|event| (event.timestamp, event.row_id))
            .map(|event| event.row_id))
    }

    async fn calculate_unreads(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<UnreadCounts, StoreError> {
        let mut inner = self.lock()?;
        inner.check("calculate_unreads")?;

        let read_up_to = inner
            .receipts
            .values()
            .filter(|r| &r.room_id == room_id && &r.user_id == user_id && r.is_read())
            .filter_map(|r| inner.event_by_id(&r.event_id))
            .map(|event| event.row_id)
            .max()
            .unwrap_or_default();

        let mut counts = UnreadCounts::default();
        for event in inner.events.range(read_up_to..).map(|(_, e)| e) {
            if event.row_id == read_up_to
                || &event.room_id != room_id
                || &event.sender == user_id
                || event.redacted_by.is_some()
            {
                continue;
            }
            counts.add_one(event.unread_type);
        }
        Ok(counts)
    }

    async fn put_receipts(&self, room_id: &RoomId, receipts: &[Receipt]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("put_receipts")?;
        for receipt in receipts {
            let key = (
                room_id.clone(),
                receipt.user_id.clone(),
                receipt.receipt_type.clone(),
                receipt.thread_id.clone(),
            );
            let newer = inner
                .receipts
                .get(&key)
                .map_or(true, |existing| existing.timestamp <= receipt.timestamp);
            if newer {
                inner.receipts.insert(key, receipt.clone());
            }
        }
        Ok(())
    }

    async fn put_account_data(&self, data: &AccountData) -> Result<AccountData, StoreError> {
        let mut inner = self.lock()?;
        inner.check("put_account_data")?;
        inner.account_data.insert(
            (data.user_id.clone(), data.room_id.clone(), data.data_type.clone()),
            data.clone(),
        );
        Ok(data.clone())
    }

    async fn get_account_data(
        &self,
        user_id: &UserId,
        room_id: Option<&RoomId>,
        data_type: &str,
    ) -> Result<Option<AccountData>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("get_account_data")?;
        Ok(inner
            .account_data
            .get(&(user_id.clone(), room_id.cloned(), data_type.to_string()))
            .cloned())
    }

    async fn put_session_request(&self, request: &SessionRequest) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("put_session_request")?;
        inner
            .session_requests
            .entry(request.session_id.clone())
            .and_modify(|existing| existing.merge(request))
            .or_insert_with(|| request.clone());
        Ok(())
    }

    async fn get_session_request(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionRequest>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("get_session_request")?;
        Ok(inner.session_requests.get(session_id).cloned())
    }

    async fn put_media(&self, media: &Media) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("put_media")?;
        let entry = inner
            .media
            .entry(media.uri.clone())
            .or_insert_with(|| Media::bare(media.uri.clone()));
        // Known metadata is never replaced by a bare reference.
        if media.file_name.is_some() {
            entry.file_name = media.file_name.clone();
        }
        if media.mime_type.is_some() {
            entry.mime_type = media.mime_type.clone();
        }
        if media.encrypted_file.is_some() {
            entry.encrypted_file = media.encrypted_file.clone();
        }
        Ok(())
    }

    async fn add_media_reference(&self, row_id: EventRowId, uri: &ContentUri) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("add_media_reference")?;
        inner.media_references.insert((row_id, uri.clone()));
        Ok(())
    }

    async fn put_next_batch(&self, user_id: &UserId, next_batch: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check("put_next_batch")?;
        inner
            .next_batch
            .insert(user_id.clone(), next_batch.to_string());
        Ok(())
    }

    async fn get_next_batch(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock()?;
        inner.check("get_next_batch")?;
        Ok(inner.next_batch.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larch_sync_types::{UnreadType, RECEIPT_TYPE_READ};
    use serde_json::json;

    fn room() -> RoomId {
        RoomId::new("!r:x")
    }

    fn event(id: &str, sender: &str, ts: i64) -> Event {
        let raw: larch_sync_types::RawEvent = serde_json::from_value(json!({
            "event_id": id,
            "type": "m.room.message",
            "sender": sender,
            "origin_server_ts": ts,
            "content": {"msgtype": "m.text", "body": id}
        }))
        .unwrap();
        let mut event = Event::from_raw(&room(), &raw);
        event.unread_type = UnreadType::NORMAL | UnreadType::NOTIFY;
        event
    }

    // ===========================================
    // Event Tests
    // ===========================================

    #[tokio::test]
    async fn upsert_assigns_increasing_row_ids() {
        let store = MemoryStore::new();
        let a = store.upsert_event(&event("$a", "@b:x", 1)).await.unwrap();
        let b = store.upsert_event(&event("$b", "@b:x", 2)).await.unwrap();
        assert!(a.is_set());
        assert!(b > a);

        let stored = store.get_event_by_id(&EventId::new("$b")).await.unwrap().unwrap();
        assert_eq!(stored.row_id, b);
    }

    #[tokio::test]
    async fn upsert_existing_returns_same_row() {
        let store = MemoryStore::new();
        let first = store.upsert_event(&event("$a", "@b:x", 1)).await.unwrap();
        let second = store.upsert_event(&event("$a", "@b:x", 1)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn redact_marks_target() {
        let store = MemoryStore::new();
        store.upsert_event(&event("$a", "@b:x", 1)).await.unwrap();

        let target = store
            .redact_event(&EventId::new("$a"), &EventId::new("$r"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target.redacted_by, Some(EventId::new("$r")));

        let missing = store
            .redact_event(&EventId::new("$zz"), &EventId::new("$r"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    // ===========================================
    // Timeline Tests
    // ===========================================

    #[tokio::test]
    async fn append_skips_present_rows() {
        let store = MemoryStore::new();
        let a = store.upsert_event(&event("$a", "@b:x", 1)).await.unwrap();
        let b = store.upsert_event(&event("$b", "@b:x", 2)).await.unwrap();

        let first = store.append_timeline(&room(), &[a]).await.unwrap();
        let second = store.append_timeline(&room(), &[a, b]).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].event_row_id, b);
        assert_eq!(store.timeline(&room()), vec![a, b]);
    }

    #[tokio::test]
    async fn prepend_keeps_chronological_order() {
        let store = MemoryStore::new();
        let a = store.upsert_event(&event("$a", "@b:x", 1)).await.unwrap();
        let b = store.upsert_event(&event("$b", "@b:x", 2)).await.unwrap();
        let c = store.upsert_event(&event("$c", "@b:x", 3)).await.unwrap();

        store.append_timeline(&room(), &[c]).await.unwrap();
        let added = store.prepend_timeline(&room(), &[a, b]).await.unwrap();

        assert_eq!(store.timeline(&room()), vec![a, b, c]);
        assert!(added[0].timeline_row_id < added[1].timeline_row_id);
    }

    #[tokio::test]
    async fn clear_timeline_drops_rows() {
        let store = MemoryStore::new();
        let a = store.upsert_event(&event("$a", "@b:x", 1)).await.unwrap();
        store.append_timeline(&room(), &[a]).await.unwrap();
        store.clear_timeline(&room()).await.unwrap();
        assert!(store.timeline(&room()).is_empty());
    }

    // ===========================================
    // Room Tests
    // ===========================================

    #[tokio::test]
    async fn preview_picks_newest_eligible() {
        let store = MemoryStore::new();
        store.upsert_event(&event("$a", "@b:x", 1)).await.unwrap();
        let b = store.upsert_event(&event("$b", "@b:x", 2)).await.unwrap();
        assert_eq!(store.recalculate_preview(&room()).await.unwrap(), Some(b));

        store
            .redact_event(&EventId::new("$b"), &EventId::new("$r"))
            .await
            .unwrap();
        let preview = store.recalculate_preview(&room()).await.unwrap().unwrap();
        let event = store.get_event_by_row_id(preview).await.unwrap().unwrap();
        assert_eq!(event.event_id, EventId::new("$a"));
    }

    #[tokio::test]
    async fn unreads_count_after_own_receipt() {
        let store = MemoryStore::new();
        let me = UserId::new("@me:x");
        store.upsert_event(&event("$a", "@b:x", 1)).await.unwrap();
        store.upsert_event(&event("$b", "@b:x", 2)).await.unwrap();
        store.upsert_event(&event("$c", "@b:x", 3)).await.unwrap();

        let all = store.calculate_unreads(&room(), &me).await.unwrap();
        assert_eq!(all.messages, 3);
        assert_eq!(all.notifications, 3);

        store
            .put_receipts(
                &room(),
                &[Receipt {
                    room_id: room(),
                    user_id: me.clone(),
                    receipt_type: RECEIPT_TYPE_READ.to_string(),
                    thread_id: None,
                    event_id: EventId::new("$b"),
                    timestamp: 10,
                }],
            )
            .await
            .unwrap();
        let after = store.calculate_unreads(&room(), &me).await.unwrap();
        assert_eq!(after.messages, 1);
    }

    #[tokio::test]
    async fn delete_room_removes_everything() {
        let store = MemoryStore::new();
        store.create_room(&room()).await.unwrap();
        let a = store.upsert_event(&event("$a", "@b:x", 1)).await.unwrap();
        store.append_timeline(&room(), &[a]).await.unwrap();

        store.delete_room(&room()).await.unwrap();

        assert!(store.get_room(&room()).await.unwrap().is_none());
        assert!(store.timeline(&room()).is_empty());
        assert_eq!(store.event_count(), 0);
    }

    // ===========================================
    // Misc Tests
    // ===========================================

    #[tokio::test]
    async fn session_requests_keep_lowest_index() {
        let store = MemoryStore::new();
        let request = |min_index| SessionRequest {
            session_id: SessionId::new("s"),
            room_id: room(),
            sender: UserId::new("@b:x"),
            min_index,
        };
        store.put_session_request(&request(9)).await.unwrap();
        store.put_session_request(&request(4)).await.unwrap();
        store.put_session_request(&request(7)).await.unwrap();

        let stored = store
            .get_session_request(&SessionId::new("s"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.min_index, 4);
    }

    #[tokio::test]
    async fn media_metadata_not_overwritten_by_bare() {
        let store = MemoryStore::new();
        let uri = ContentUri::parse("mxc://x/abc").unwrap();
        store
            .put_media(&Media {
                mime_type: Some("image/png".into()),
                ..Media::bare(uri.clone())
            })
            .await
            .unwrap();
        store.put_media(&Media::bare(uri.clone())).await.unwrap();
        assert_eq!(store.media(&uri).unwrap().mime_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let store = MemoryStore::new();
        store.fail_next("get_room", "boom");

        let err = store.get_room(&room()).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(ref msg) if msg == "boom"));
        assert!(store.get_room(&room()).await.is_ok());
    }
}

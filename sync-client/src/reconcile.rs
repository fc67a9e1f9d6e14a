//! Per-room reconciliation.
//!
//! One pass per joined room: every mutation goes to a working copy of the
//! stored [`Room`], and the copy is written back only if [`diff_rooms`]
//! finds a tracked field that changed. The pass emits one [`SyncRoom`]
//! record with everything the UI needs to refresh.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use larch_sync_core::{
    apply_state_event, bump_sorting_timestamp, diff_rooms, participant_name, reconcile_summary,
    DecryptionRetryQueue, HeroMember, ParticipantName,
};
use larch_sync_types::{
    event_type, AccountData, Event, EventId, EventKind, EventRowId, JoinedRoom, LazyLoadSummary,
    Membership, NameQuality, RawEvent, Receipt, RelationType, Room, RoomId, SyncNotification,
    SyncRoom, Timeline, TimelineRowTuple, Typing, UnreadCounts, UnreadType, UserId,
    RECEIPT_TYPE_READ, SORTING_TIMESTAMP_UNSET,
};

use crate::error::{InterruptReason, Result, StoreResultExt};
use crate::ingest::{ClientEvent, IngestContext};
use crate::normalize::{EventNormalizer, RetrySink};

/// Result of reconciling one room.
#[derive(Debug, Default)]
pub(crate) struct RoomOutcome {
    /// Record for the aggregated notification, if anything changed.
    pub record: Option<SyncRoom>,
    /// Session requests were persisted; the retry worker should wake.
    pub wake_retry: bool,
}

/// Working state of one reconciliation pass.
struct Pass {
    snapshot: Room,
    room: Room,
    summary: Option<LazyLoadSummary>,
    heroes_changed: bool,
    new_unreads: UnreadCounts,
    maybe_redacted_unread: bool,
    recalculate_preview: bool,
    events: Vec<Event>,
    state: BTreeMap<String, BTreeMap<String, EventRowId>>,
    notifications: Vec<SyncNotification>,
    receipts: Vec<Receipt>,
    own_receipts: Vec<EventId>,
    retry: DecryptionRetryQueue,
}

impl Pass {
    fn new(snapshot: Room) -> Self {
        Self {
            room: snapshot.clone(),
            snapshot,
            summary: None,
            heroes_changed: false,
            new_unreads: UnreadCounts::default(),
            maybe_redacted_unread: false,
            recalculate_preview: false,
            events: Vec::new(),
            state: BTreeMap::new(),
            notifications: Vec::new(),
            receipts: Vec::new(),
            own_receipts: Vec::new(),
            retry: DecryptionRetryQueue::new(),
        }
    }

    /// Add an event to the change set, replacing an older copy of the row.
    fn push_event(&mut self, event: Event) {
        match self.events.iter_mut().find(|e| e.row_id == event.row_id) {
            Some(existing) => *existing = event,
            None => self.events.push(event),
        }
    }
}

pub(crate) struct RoomReconciler<'a> {
    ctx: &'a IngestContext<'a>,
    normalizer: EventNormalizer<'a>,
}

impl<'a> RoomReconciler<'a> {
    pub fn new(ctx: &'a IngestContext<'a>) -> Self {
        Self {
            ctx,
            normalizer: EventNormalizer::new(ctx),
        }
    }

    /// Reconcile one joined room.
    pub async fn reconcile_joined(&self, room_id: &RoomId, joined: &JoinedRoom) -> Result<RoomOutcome> {
        let ctx = self.ctx;
        let snapshot = match ctx
            .store
            .get_room(room_id)
            .await
            .context("failed to get room data")?
        {
            Some(room) => room,
            None => {
                ctx.store
                    .create_room(room_id)
                    .await
                    .context("failed to ensure room row exists")?;
                Room::new(room_id.clone())
            }
        };
        let mut pass = Pass::new(snapshot);

        let mut account_data = BTreeMap::new();
        for event in &joined.account_data.events {
            let data = AccountData {
                user_id: ctx.own_user.clone(),
                room_id: Some(room_id.clone()),
                data_type: event.event_type.clone(),
                content: event.content.clone(),
            };
            let stored = ctx
                .store
                .put_account_data(&data)
                .await
                .with_context(|| format!("failed to save room account data event {}", event.event_type))?;
            account_data.insert(event.event_type.clone(), stored);
        }

        for event in &joined.ephemeral.events {
            match event.event_type.as_str() {
                event_type::RECEIPT => {
                    let (receipts, own) = flatten_receipts(room_id, ctx.own_user, &event.content);
                    pass.receipts.extend(receipts);
                    pass.own_receipts.extend(own);
                }
                event_type::TYPING => match TypingContent::deserialize(&event.content) {
                    Ok(typing) => ctx.publish(ClientEvent::Typing(Typing {
                        room_id: room_id.clone(),
                        user_ids: typing.user_ids,
                    })),
                    Err(err) => tracing::debug!("Ignoring malformed typing event in {}: {}", room_id, err),
                },
                _ => {}
            }
        }

        let summary = reconcile_summary(pass.snapshot.lazy_load_summary.as_ref(), &joined.summary);
        if summary.heroes_changed {
            pass.room.lazy_load_summary = summary.effective.clone();
        }
        pass.heroes_changed = summary.heroes_changed;
        pass.summary = summary.effective;

        for raw in &joined.state.events {
            if raw.state_key.is_none() {
                tracing::warn!("Skipping state event {} without state key in {}", raw.event_id, room_id);
                continue;
            }
            self.process_event(room_id, &mut pass, raw, false, false).await?;
        }

        let tuples = self
            .process_timeline(room_id, &mut pass, &joined.timeline)
            .await?;

        let mut wake_retry = false;
        for request in pass.retry.drain() {
            ctx.store
                .put_session_request(&request)
                .await
                .with_context(|| format!("failed to save session request for {}", request.session_id))?;
            wake_retry = true;
        }

        if pass.recalculate_preview && pass.room.preview_event.is_none() {
            pass.room.preview_event = ctx
                .store
                .recalculate_preview(room_id)
                .await
                .context("failed to recalculate preview event")?;
            if let Some(row_id) = pass.room.preview_event {
                self.add_old_event_by_row(&mut pass, row_id).await?;
            }
        }

        // Names from heroes never override a better name.
        if (pass.heroes_changed && pass.room.name_quality <= NameQuality::Participants)
            || pass.room.name_quality == NameQuality::Nil
        {
            let ParticipantName { name, avatar } = self.participant_name(room_id, &pass).await?;
            pass.room.name = Some(name);
            pass.room.name_quality = NameQuality::Participants;
            if let Some(avatar) = avatar {
                if !pass.room.explicit_avatar {
                    pass.room.avatar = Some(avatar);
                }
            }
        }

        if let Some(marked) = account_data
            .get(event_type::MARKED_UNREAD)
            .or_else(|| account_data.get(event_type::MARKED_UNREAD_UNSTABLE))
        {
            pass.room.marked_unread = marked
                .content
                .get("unread")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }

        if !pass.receipts.is_empty() {
            ctx.store
                .put_receipts(room_id, &pass.receipts)
                .await
                .context("failed to save receipts")?;
        }

        // Redacting an unread event, or a receipt whose target we never
        // counted, can leave counts that only the store can recompute.
        let own_receipts_cleared = !pass.own_receipts.is_empty() && pass.new_unreads.is_zero();
        if pass.maybe_redacted_unread || (!pass.snapshot.unreads.is_zero() && own_receipts_cleared) {
            pass.room.unreads = ctx
                .store
                .calculate_unreads(room_id, ctx.own_user)
                .await
                .context("failed to recalculate unread counts")?;
        } else {
            let new_unreads = pass.new_unreads;
            pass.room.unreads.add(&new_unreads);
        }

        let changed = !diff_rooms(&pass.snapshot, &pass.room).is_empty();
        if changed {
            ctx.store
                .upsert_room(&pass.room)
                .await
                .context("failed to save room data")?;
        }

        let has_content = changed
            || !account_data.is_empty()
            || !pass.own_receipts.is_empty()
            || !tuples.is_empty()
            || !pass.events.is_empty()
            || !pass.state.is_empty();
        let record = if has_content {
            Some(SyncRoom {
                meta: changed.then_some(pass.room),
                timeline: tuples,
                state: pass.state,
                reset: joined.timeline.limited,
                events: pass.events,
                account_data,
                notifications: pass.notifications,
            })
        } else {
            None
        };
        Ok(RoomOutcome { record, wake_retry })
    }

    async fn process_timeline(
        &self,
        room_id: &RoomId,
        pass: &mut Pass,
        timeline: &Timeline,
    ) -> Result<Vec<TimelineRowTuple>> {
        let ctx = self.ctx;
        let mut rows = Vec::with_capacity(timeline.events.len());

        if !timeline.events.is_empty() {
            let read_up_to = self.find_read_watermark(room_id, pass, &timeline.events).await?;
            for (index, raw) in timeline.events.iter().enumerate() {
                let unread = read_up_to.map_or(true, |watermark| index > watermark);
                let row_id = self.process_event(room_id, pass, raw, true, unread).await?;
                rows.push(row_id);
            }
            if pass.room.sorting_timestamp <= SORTING_TIMESTAMP_UNSET {
                if let Some(last) = timeline.events.last() {
                    pass.room.sorting_timestamp = last.origin_server_ts;
                }
            }
        }

        let prev_batch = timeline.prev_batch.as_deref().filter(|t| !t.is_empty());
        if timeline.limited {
            ctx.store
                .clear_timeline(room_id)
                .await
                .context("failed to clear old timeline")?;
            pass.room.prev_batch = prev_batch.map(str::to_string);
            ctx.pagination
                .interrupt(room_id, InterruptReason::TimelineReset);
        } else if pass.room.prev_batch.as_deref().map_or(true, str::is_empty) {
            if let Some(token) = prev_batch {
                pass.room.prev_batch = Some(token.to_string());
            }
        }

        if rows.is_empty() {
            return Ok(Vec::new());
        }
        ctx.store
            .append_timeline(room_id, &rows)
            .await
            .context("failed to append timeline")
    }

    /// Scan backward for the newest event we sent or already read.
    ///
    /// Unread counters restart from zero at that event. A new own event
    /// without a receipt gets a synthesized one.
    async fn find_read_watermark(
        &self,
        room_id: &RoomId,
        pass: &mut Pass,
        events: &[RawEvent],
    ) -> Result<Option<usize>> {
        let ctx = self.ctx;
        for (index, raw) in events.iter().enumerate().rev() {
            let is_read = pass.own_receipts.contains(&raw.event_id);
            let is_own = &raw.sender == ctx.own_user;
            if !is_read && !is_own {
                continue;
            }
            if !is_read {
                let known = ctx
                    .store
                    .get_event_by_id(&raw.event_id)
                    .await
                    .with_context(|| format!("failed to check if event {} exists", raw.event_id))?
                    .is_some();
                if known {
                    // Counts were reset when this event was first stored;
                    // resetting again on a replayed batch would drop unreads
                    // counted after it.
                    return Ok(Some(index));
                }
                pass.receipts.push(Receipt {
                    room_id: room_id.clone(),
                    user_id: ctx.own_user.clone(),
                    receipt_type: RECEIPT_TYPE_READ.to_string(),
                    thread_id: None,
                    event_id: raw.event_id.clone(),
                    timestamp: raw.origin_server_ts,
                });
                pass.own_receipts.push(raw.event_id.clone());
            }
            pass.room.unreads = UnreadCounts::default();
            return Ok(Some(index));
        }
        Ok(None)
    }

    async fn process_event(
        &self,
        room_id: &RoomId,
        pass: &mut Pass,
        raw: &RawEvent,
        is_timeline: bool,
        is_unread: bool,
    ) -> Result<EventRowId> {
        let ctx = self.ctx;
        let normalized = self
            .normalizer
            .process(room_id, raw, pass.summary.as_ref(), RetrySink::Batch(&mut pass.retry))
            .await?;
        let event = normalized.event;
        let row_id = event.row_id;
        if !normalized.is_new {
            // State stored earlier (by pagination) still becomes current.
            if let Some(state_key) = event.state_key.clone() {
                self.apply_state(room_id, pass, &event, &state_key).await?;
            }
            return Ok(row_id);
        }

        if is_unread && !event.unread_type.is_none() {
            pass.new_unreads.add_one(event.unread_type);
            if event.unread_type.is(UnreadType::NOTIFY) && ctx.first_sync_received {
                pass.notifications.push(SyncNotification {
                    event_row_id: row_id,
                    sound: event.unread_type.is(UnreadType::SOUND),
                });
            }
        }

        if is_timeline {
            if event.can_use_for_preview() {
                pass.room.preview_event = Some(row_id);
                pass.recalculate_preview = false;
            }
            bump_sorting_timestamp(&mut pass.room, &event);
        }

        if let Some(state_key) = event.state_key.clone() {
            self.apply_state(room_id, pass, &event, &state_key).await?;
        }

        let relation = event.relation_type.zip(event.relates_to.clone());
        pass.push_event(event);

        if let Some(target) = normalized.redacts {
            self.process_redaction(pass, &raw.event_id, &target).await?;
        } else if let Some((RelationType::Replace | RelationType::Annotation, target)) = relation {
            self.add_old_event_by_id(pass, &target).await?;
        }
        Ok(row_id)
    }

    async fn apply_state(&self, room_id: &RoomId, pass: &mut Pass, event: &Event, state_key: &str) -> Result<()> {
        let kind = event.effective_kind();
        let membership = match kind {
            EventKind::Member => event
                .content
                .get("membership")
                .and_then(Value::as_str)
                .and_then(Membership::parse),
            _ => None,
        };
        let hero = pass
            .summary
            .as_ref()
            .and_then(|s| s.heroes.as_ref())
            .is_some_and(|heroes| heroes.iter().any(|h| h.as_str() == state_key));
        if (kind == EventKind::Member && hero) || kind == EventKind::FunctionalMembers {
            pass.heroes_changed = true;
        }

        self.ctx
            .store
            .set_current_state(room_id, &event.event_type, state_key, event.row_id, membership)
            .await
            .with_context(|| format!("failed to save current state event {}", event.event_id))?;
        pass.state
            .entry(event.event_type.clone())
            .or_default()
            .insert(state_key.to_string(), event.row_id);

        if let Err(err) = apply_state_event(
            &pass.snapshot,
            &mut pass.room,
            &event.event_type,
            state_key,
            &event.content,
        ) {
            tracing::warn!("Skipping malformed state event {} in {}: {}", event.event_id, room_id, err);
        }
        Ok(())
    }

    async fn process_redaction(&self, pass: &mut Pass, redaction: &EventId, target: &EventId) -> Result<()> {
        let Some(target) = self
            .ctx
            .store
            .redact_event(target, redaction)
            .await
            .with_context(|| format!("failed to redact event {}", target))?
        else {
            return Ok(());
        };
        if !target.unread_type.is_none() {
            pass.maybe_redacted_unread = true;
        }
        if pass.room.preview_event == Some(target.row_id) {
            pass.room.preview_event = None;
            pass.recalculate_preview = true;
        }
        let relation = target.relation_type.zip(target.relates_to.clone());
        pass.push_event(target);
        if let Some((RelationType::Replace | RelationType::Annotation, related)) = relation {
            self.add_old_event_by_id(pass, &related).await?;
        }
        Ok(())
    }

    async fn add_old_event_by_id(&self, pass: &mut Pass, event_id: &EventId) -> Result<()> {
        let event = self
            .ctx
            .store
            .get_event_by_id(event_id)
            .await
            .with_context(|| format!("failed to get relation target {}", event_id))?;
        if let Some(event) = event {
            pass.push_event(event);
        }
        Ok(())
    }

    async fn add_old_event_by_row(&self, pass: &mut Pass, row_id: EventRowId) -> Result<()> {
        let event = self
            .ctx
            .store
            .get_event_by_row_id(row_id)
            .await
            .with_context(|| format!("failed to get event row {}", row_id))?;
        if let Some(event) = event {
            pass.push_event(event);
        }
        Ok(())
    }

    async fn participant_name(&self, room_id: &RoomId, pass: &Pass) -> Result<ParticipantName> {
        let store = self.ctx.store;
        let functional_members: Vec<UserId> = store
            .get_current_state(room_id, event_type::FUNCTIONAL_MEMBERS, "")
            .await
            .context("failed to get functional members state event")?
            .and_then(|event| FunctionalMembersContent::deserialize(&event.content).ok())
            .map(|content| content.service_members)
            .unwrap_or_default();

        let heroes = pass
            .summary
            .as_ref()
            .and_then(|s| s.heroes.clone())
            .unwrap_or_default();
        let mut members = HashMap::new();
        let mut seen = HashSet::new();
        for hero in heroes {
            if functional_members.contains(&hero) || !seen.insert(hero.clone()) {
                continue;
            }
            let event = store
                .get_current_state(room_id, event_type::MEMBER, hero.as_str())
                .await
                .with_context(|| format!("failed to get {}'s member event", hero))?;
            if let Some(event) = event {
                let content = MemberContent::deserialize(&event.content).unwrap_or_default();
                members.insert(
                    hero,
                    HeroMember {
                        membership: content.membership.as_deref().and_then(Membership::parse),
                        display_name: content.displayname,
                        avatar_url: content.avatar_url,
                    },
                );
            }
        }
        Ok(participant_name(pass.summary.as_ref(), &functional_members, &members))
    }
}

#[derive(Deserialize)]
struct TypingContent {
    #[serde(default)]
    user_ids: Vec<UserId>,
}

#[derive(Deserialize)]
struct FunctionalMembersContent {
    #[serde(default)]
    service_members: Vec<UserId>,
}

#[derive(Default, Deserialize)]
struct MemberContent {
    #[serde(default)]
    membership: Option<String>,
    #[serde(default)]
    displayname: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

/// Flatten `m.receipt` content into receipt rows.
///
/// Also returns the event ids our own read receipts point at.
fn flatten_receipts(room_id: &RoomId, own_user: &UserId, content: &Value) -> (Vec<Receipt>, Vec<EventId>) {
    let mut receipts = Vec::new();
    let mut own = Vec::new();
    let Some(by_event) = content.as_object() else {
        return (receipts, own);
    };
    for (event_id, by_type) in by_event {
        let Some(by_type) = by_type.as_object() else {
            continue;
        };
        for (receipt_type, by_user) in by_type {
            let Some(by_user) = by_user.as_object() else {
                continue;
            };
            for (user_id, data) in by_user {
                let receipt = Receipt {
                    room_id: room_id.clone(),
                    user_id: UserId::new(user_id.as_str()),
                    receipt_type: receipt_type.clone(),
                    thread_id: data
                        .get("thread_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    event_id: EventId::new(event_id.as_str()),
                    timestamp: data.get("ts").and_then(Value::as_i64).unwrap_or_default(),
                };
                if &receipt.user_id == own_user && receipt.is_read() {
                    own.push(receipt.event_id.clone());
                }
                receipts.push(receipt);
            }
        }
    }
    (receipts, own)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn room() -> RoomId {
        RoomId::new("!r:x")
    }

    // ===========================================
    // Receipt Flattening Tests
    // ===========================================

    #[test]
    fn receipts_are_flattened() {
        let content = json!({
            "$a": {"m.read": {"@b:x": {"ts": 10}, "@me:x": {"ts": 11}}},
            "$b": {"m.read.private": {"@me:x": {"ts": 12, "thread_id": "main"}}}
        });
        let (receipts, own) = flatten_receipts(&room(), &UserId::new("@me:x"), &content);

        assert_eq!(receipts.len(), 3);
        assert_eq!(own, vec![EventId::new("$a"), EventId::new("$b")]);
        let private = receipts
            .iter()
            .find(|r| r.receipt_type == "m.read.private")
            .unwrap();
        assert_eq!(private.thread_id.as_deref(), Some("main"));
        assert_eq!(private.timestamp, 12);
    }

    #[test]
    fn foreign_receipt_types_are_not_own_reads() {
        let content = json!({"$a": {"m.fully_read": {"@me:x": {"ts": 1}}}});
        let (receipts, own) = flatten_receipts(&room(), &UserId::new("@me:x"), &content);
        assert_eq!(receipts.len(), 1);
        assert!(own.is_empty());
    }

    #[test]
    fn malformed_receipts_are_skipped() {
        let content = json!({"$a": "nope", "$b": {"m.read": 5}});
        let (receipts, own) = flatten_receipts(&room(), &UserId::new("@me:x"), &content);
        assert!(receipts.is_empty());
        assert!(own.is_empty());
        assert!(flatten_receipts(&room(), &UserId::new("@me:x"), &json!([])).0.is_empty());
    }

    // ===========================================
    // Pass Tests
    // ===========================================

    #[test]
    fn push_event_replaces_same_row() {
        let mut pass = Pass::new(Room::new(room()));
        let raw: RawEvent = serde_json::from_value(json!({
            "event_id": "$a", "type": "m.room.message", "sender": "@b:x", "content": {}
        }))
        .unwrap();
        let mut event = Event::from_raw(&room(), &raw);
        event.row_id = EventRowId::new(3);
        pass.push_event(event.clone());

        event.redacted_by = Some(EventId::new("$r"));
        pass.push_event(event);

        assert_eq!(pass.events.len(), 1);
        assert!(pass.events[0].redacted_by.is_some());
    }
}

//! Sync batch ingestion.
//!
//! [`Ingestor`] sequences one batch: to-device routing, device list
//! invalidation, global account data, per-room reconciliation, left-room
//! deletion and the since-token. It tracks the sync status and publishes
//! [`ClientEvent`]s on an unbounded channel.
//!
//! # Ordering
//!
//! Calls are serialized by an internal async mutex; a batch never starts
//! before the previous one committed. Deferred to-device work runs on a
//! detached task with no ordering guarantee against later batches.

use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use larch_sync_core::{ContentOptions, StatusEvent, SyncStatusMachine};
use larch_sync_types::{
    event_type, AccountData, Event, RawEvent, RoomId, SyncBatch, SyncComplete, SyncStatus,
    TimelineRowTuple, Typing, UserId,
};

use crate::config::{IngestConfig, SteadyStateTimeouts};
use crate::crypto::Crypto;
use crate::error::{CryptoResultExt, Result, StoreResultExt, SyncProcessingError};
use crate::normalize::{EventNormalizer, RetrySink};
use crate::pagination::PaginationRegistry;
use crate::push::PushRules;
use crate::reconcile::RoomReconciler;
use crate::store::{Store, StoreError};
use crate::to_device::{apply_deferred, route_to_device};

/// Notifications published by the ingestor.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Aggregated changes of one successful batch. Never empty.
    SyncComplete(SyncComplete),
    /// The sync status changed.
    SyncStatus(SyncStatus),
    /// Typing users of a room changed.
    Typing(Typing),
}

/// Receiving ends handed to the host when an [`Ingestor`] is created.
#[derive(Debug)]
pub struct IngestHandles {
    /// Client notifications.
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    /// Fires once, after the first successful batch, with the timeouts the
    /// transport should switch to.
    pub steady_state: oneshot::Receiver<SteadyStateTimeouts>,
    /// Coalescing wake signal for the session re-request worker.
    pub retry_wake: Arc<Notify>,
}

/// One page of room history, as returned by a backward `/messages` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    /// Events, newest first.
    pub events: Vec<RawEvent>,
    /// Token for the next older page; `None` at the start of the room.
    pub end: Option<String>,
}

/// Result of a committed pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginationResult {
    /// Stored events, oldest first.
    pub events: Vec<Event>,
    /// Timeline tuples added before the existing timeline.
    pub timeline: Vec<TimelineRowTuple>,
    /// More history is available.
    pub has_more: bool,
}

/// Collaborators and settings shared by one ingest or pagination pass.
pub(crate) struct IngestContext<'a> {
    pub store: &'a dyn Store,
    pub crypto: &'a dyn Crypto,
    pub push_rules: &'a dyn PushRules,
    pub own_user: &'a UserId,
    pub content: &'a ContentOptions,
    pub retry_wake: &'a Notify,
    pub pagination: &'a PaginationRegistry,
    pub events: &'a mpsc::UnboundedSender<ClientEvent>,
    /// Notifications for new messages are only produced after the initial
    /// backlog.
    pub first_sync_received: bool,
}

impl IngestContext<'_> {
    /// Send a side-channel notification. Dropped if nobody listens.
    pub fn publish(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Dropping client event: receiver closed");
        }
    }
}

struct IngestState {
    status: SyncStatusMachine,
    first_sync_received: bool,
    steady_state: Option<oneshot::Sender<SteadyStateTimeouts>>,
}

/// Sync ingestion engine for one account.
pub struct Ingestor {
    own_user: UserId,
    store: Arc<dyn Store>,
    crypto: Arc<dyn Crypto>,
    push_rules: Arc<dyn PushRules>,
    config: IngestConfig,
    content: ContentOptions,
    pagination: Arc<PaginationRegistry>,
    events: mpsc::UnboundedSender<ClientEvent>,
    retry_wake: Arc<Notify>,
    state: Mutex<IngestState>,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("own_user", &self.own_user)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Ingestor {
    /// Create an ingestor for `own_user`.
    pub fn new(
        own_user: UserId,
        store: Arc<dyn Store>,
        crypto: Arc<dyn Crypto>,
        push_rules: Arc<dyn PushRules>,
        config: IngestConfig,
    ) -> (Self, IngestHandles) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (steady_tx, steady_rx) = oneshot::channel();
        let retry_wake = Arc::new(Notify::new());
        let ingestor = Self {
            own_user,
            store,
            crypto,
            push_rules,
            content: config.content.options(),
            config,
            pagination: Arc::new(PaginationRegistry::new()),
            events: events_tx,
            retry_wake: Arc::clone(&retry_wake),
            state: Mutex::new(IngestState {
                status: SyncStatusMachine::new(),
                first_sync_received: false,
                steady_state: Some(steady_tx),
            }),
        };
        let handles = IngestHandles {
            events: events_rx,
            steady_state: steady_rx,
            retry_wake,
        };
        (ingestor, handles)
    }

    /// Account this ingestor writes for.
    pub fn own_user(&self) -> &UserId {
        &self.own_user
    }

    /// Registry of running pagination tasks.
    pub fn pagination(&self) -> &Arc<PaginationRegistry> {
        &self.pagination
    }

    /// Current sync status. Waits for a running batch to finish.
    pub async fn status(&self) -> SyncStatus {
        self.state.lock().await.status.status().clone()
    }

    fn context(&self, first_sync_received: bool) -> IngestContext<'_> {
        IngestContext {
            store: self.store.as_ref(),
            crypto: self.crypto.as_ref(),
            push_rules: self.push_rules.as_ref(),
            own_user: &self.own_user,
            content: &self.content,
            retry_wake: &self.retry_wake,
            pagination: &self.pagination,
            events: &self.events,
            first_sync_received,
        }
    }

    /// Ingest one sync batch.
    ///
    /// On error the since-token is not advanced. Rooms committed before the
    /// failure stay committed; re-ingesting the batch is idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first storage or crypto failure. The sync status moves to
    /// `Errored` either way.
    pub async fn ingest(&self, batch: &SyncBatch, since: &str) -> Result<SyncComplete> {
        let mut state = self.state.lock().await;
        tracing::debug!(
            "Processing sync batch {} -> {} ({} joined, {} left)",
            since,
            batch.next_batch,
            batch.rooms.join.len(),
            batch.rooms.leave.len()
        );

        let result = self.process_batch(&mut state, batch).await;
        let outcome = match &result {
            Ok(_) => StatusEvent::BatchSucceeded { at: now_ms() },
            Err(err) => {
                tracing::warn!("Failed to process sync batch: {}", err);
                StatusEvent::BatchFailed {
                    error: err.to_string(),
                }
            }
        };
        let (status, changed) = std::mem::take(&mut state.status).on_event(outcome);
        state.status = status;
        if let Some(status) = changed {
            self.context(state.first_sync_received)
                .publish(ClientEvent::SyncStatus(status));
        }
        result
    }

    async fn process_batch(&self, state: &mut IngestState, batch: &SyncBatch) -> Result<SyncComplete> {
        let ctx = self.context(state.first_sync_received);

        let deferred = route_to_device(ctx.crypto, &batch.to_device.events).await;

        let mut wake_retry = false;
        if !batch.device_lists.changed.is_empty() {
            ctx.crypto
                .mark_tracked_users_outdated(&batch.device_lists.changed)
                .await
                .context("failed to mark changed devices as outdated")?;
            tracing::debug!(
                "Marked device lists of {} users outdated",
                batch.device_lists.changed.len()
            );
            wake_retry = true;
        }

        let mut complete = SyncComplete::default();
        for event in &batch.account_data.events {
            let data = AccountData {
                user_id: self.own_user.clone(),
                room_id: None,
                data_type: event.event_type.clone(),
                content: event.content.clone(),
            };
            let stored = ctx
                .store
                .put_account_data(&data)
                .await
                .with_context(|| format!("failed to save account data event {}", event.event_type))?;
            if event.event_type == event_type::PUSH_RULES {
                match ctx.push_rules.update_rules(&event.content) {
                    Ok(()) => tracing::debug!("Updated push rules"),
                    Err(err) => tracing::warn!("Failed to apply push rules: {}", err),
                }
            }
            complete.account_data.insert(event.event_type.clone(), stored);
        }

        let reconciler = RoomReconciler::new(&ctx);
        for (room_id, joined) in &batch.rooms.join {
            let outcome = reconciler.reconcile_joined(room_id, joined).await?;
            wake_retry |= outcome.wake_retry;
            if let Some(record) = outcome.record {
                complete.rooms.insert(room_id.clone(), record);
            }
        }

        for room_id in batch.rooms.leave.keys() {
            ctx.store
                .delete_room(room_id)
                .await
                .with_context(|| format!("failed to delete left room {}", room_id))?;
            tracing::debug!("Deleted left room {}", room_id);
            complete.left_rooms.push(room_id.clone());
        }

        ctx.store
            .put_next_batch(&self.own_user, &batch.next_batch)
            .await
            .context("failed to save next batch")?;

        if !batch.device_one_time_keys_count.is_empty() {
            ctx.crypto
                .handle_otk_counts(&batch.device_one_time_keys_count)
                .await;
        }
        if !deferred.is_empty() {
            let crypto = Arc::clone(&self.crypto);
            tokio::spawn(async move {
                apply_deferred(crypto.as_ref(), deferred).await;
            });
        }
        if wake_retry {
            self.retry_wake.notify_one();
        }
        if !state.first_sync_received {
            state.first_sync_received = true;
            tracing::info!("First sync completed");
            if let Some(signal) = state.steady_state.take() {
                // The transport may not be listening; the timeouts are advisory.
                let _ = signal.send(self.config.transport.steady_state());
            }
        }

        // The batch is committed; a missing listener does not undo it.
        if !complete.is_empty() {
            ctx.publish(ClientEvent::SyncComplete(complete.clone()));
        }
        Ok(complete)
    }

    /// Fetch one page of older history for a room and prepend it.
    ///
    /// `fetch` receives the room's pagination token. Only one pagination per
    /// room runs at a time. If a batch resets the room's timeline while the
    /// fetch is running, nothing is committed.
    ///
    /// # Errors
    ///
    /// - [`SyncProcessingError::PaginationInProgress`] if the room is
    ///   already being paginated
    /// - [`SyncProcessingError::PaginationInterrupted`] on a timeline reset
    /// - [`SyncProcessingError::HistoryFetch`] if `fetch` fails
    pub async fn paginate<F, Fut, E>(&self, room_id: &RoomId, fetch: F) -> Result<PaginationResult>
    where
        F: FnOnce(Option<String>) -> Fut,
        Fut: Future<Output = std::result::Result<HistoryPage, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let room = self
            .store
            .get_room(room_id)
            .await
            .context("failed to get room data")?
            .ok_or_else(|| StoreError::NotFound {
                what: format!("room {}", room_id),
            })
            .context("failed to get room data")?;

        let mut guard = self.pagination.register(room_id)?;
        let page = tokio::select! {
            reason = guard.interrupted() => {
                tracing::info!("Pagination in {} interrupted: {}", room_id, reason);
                return Err(SyncProcessingError::PaginationInterrupted(reason));
            }
            page = fetch(room.prev_batch.clone()) => {
                page.map_err(|err| SyncProcessingError::HistoryFetch(err.into()))?
            }
        };

        let state = self.state.lock().await;
        if let Err(err) = guard.check() {
            tracing::info!("Pagination in {} interrupted: {}", room_id, err);
            return Err(err);
        }

        let ctx = self.context(state.first_sync_received);
        let normalizer = EventNormalizer::new(&ctx);
        let summary = room.lazy_load_summary.as_ref();
        let mut events = Vec::with_capacity(page.events.len());
        for raw in page.events.iter().rev() {
            let normalized = normalizer
                .process(room_id, raw, summary, RetrySink::Immediate)
                .await?;
            events.push(normalized.event);
        }
        let rows: Vec<_> = events.iter().map(|event| event.row_id).collect();
        let timeline = ctx
            .store
            .prepend_timeline(room_id, &rows)
            .await
            .context("failed to prepend timeline")?;

        let mut current = ctx
            .store
            .get_room(room_id)
            .await
            .context("failed to get room data")?
            .unwrap_or(room);
        current.prev_batch = page.end.clone();
        ctx.store
            .upsert_room(&current)
            .await
            .context("failed to save room data")?;
        drop(state);

        Ok(PaginationResult {
            events,
            timeline,
            has_more: page.end.is_some(),
        })
    }

    /// Recompute stale local content of a stored message.
    ///
    /// Returns the updated event, or `None` if it was already current.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated content cannot be stored.
    pub async fn reprocess_existing_event(&self, event: &Event) -> Result<Option<Event>> {
        let ctx = self.context(true);
        EventNormalizer::new(&ctx).reprocess(event).await
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MockCrypto;
    use crate::push::StaticPushRules;
    use crate::store::MemoryStore;
    use larch_sync_types::{EventId, SyncStatus};
    use serde_json::json;

    struct Harness {
        ingestor: Ingestor,
        handles: IngestHandles,
        store: MemoryStore,
        crypto: MockCrypto,
    }

    fn harness() -> Harness {
        let store = MemoryStore::new();
        let crypto = MockCrypto::new();
        let (ingestor, handles) = Ingestor::new(
            UserId::new("@me:x"),
            Arc::new(store.clone()),
            Arc::new(crypto.clone()),
            Arc::new(StaticPushRules::new(UserId::new("@me:x"))),
            IngestConfig::default(),
        );
        Harness {
            ingestor,
            handles,
            store,
            crypto,
        }
    }

    fn batch(value: serde_json::Value) -> SyncBatch {
        serde_json::from_value(value).unwrap()
    }

    // ===========================================
    // Batch Sequencing Tests
    // ===========================================

    #[tokio::test]
    async fn empty_batch_persists_token_and_publishes_nothing() {
        let mut h = harness();
        let complete = h
            .ingestor
            .ingest(&batch(json!({"next_batch": "s1"})), "")
            .await
            .unwrap();

        assert!(complete.is_empty());
        assert_eq!(
            h.store.get_next_batch(&UserId::new("@me:x")).await.unwrap().as_deref(),
            Some("s1")
        );
        // Only the Waiting -> Ok status change.
        assert!(matches!(
            h.handles.events.try_recv(),
            Ok(ClientEvent::SyncStatus(SyncStatus::Ok))
        ));
        assert!(h.handles.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn steady_state_signal_fires_once() {
        let mut h = harness();
        h.ingestor.ingest(&batch(json!({"next_batch": "s1"})), "").await.unwrap();
        let timeouts = h.handles.steady_state.try_recv().unwrap();
        assert_eq!(timeouts, IngestConfig::default().transport.steady_state());

        h.ingestor.ingest(&batch(json!({"next_batch": "s2"})), "s1").await.unwrap();
    }

    #[tokio::test]
    async fn device_list_changes_wake_retry_worker() {
        let h = harness();
        h.ingestor
            .ingest(
                &batch(json!({"next_batch": "s1", "device_lists": {"changed": ["@b:x"]}})),
                "",
            )
            .await
            .unwrap();

        assert_eq!(h.crypto.outdated_users(), vec![UserId::new("@b:x")]);
        // A stored permit completes immediately.
        tokio::time::timeout(std::time::Duration::from_millis(100), h.handles.retry_wake.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn crypto_failure_keeps_since_token() {
        let mut h = harness();
        h.crypto.fail_next_mark_outdated("db locked");

        let err = h
            .ingestor
            .ingest(
                &batch(json!({"next_batch": "s1", "device_lists": {"changed": ["@b:x"]}})),
                "",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncProcessingError::Crypto { .. }));
        assert!(h.store.get_next_batch(&UserId::new("@me:x")).await.unwrap().is_none());
        match h.handles.events.try_recv() {
            Ok(ClientEvent::SyncStatus(SyncStatus::Errored { error_count, .. })) => {
                assert_eq!(error_count, 1)
            }
            other => panic!("expected errored status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn global_account_data_is_stored_and_published() {
        let mut h = harness();
        let complete = h
            .ingestor
            .ingest(
                &batch(json!({
                    "next_batch": "s1",
                    "account_data": {"events": [{"type": "m.direct", "content": {"@b:x": ["!r:x"]}}]}
                })),
                "",
            )
            .await
            .unwrap();

        assert!(complete.account_data.contains_key("m.direct"));
        let stored = h
            .store
            .get_account_data(&UserId::new("@me:x"), None, "m.direct")
            .await
            .unwrap();
        assert!(stored.is_some());

        let mut saw_complete = false;
        while let Ok(event) = h.handles.events.try_recv() {
            saw_complete |= matches!(event, ClientEvent::SyncComplete(_));
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn left_rooms_are_deleted() {
        let h = harness();
        h.store.create_room(&RoomId::new("!gone:x")).await.unwrap();

        let complete = h
            .ingestor
            .ingest(
                &batch(json!({"next_batch": "s1", "rooms": {"leave": {"!gone:x": {}}}})),
                "",
            )
            .await
            .unwrap();

        assert_eq!(complete.left_rooms, vec![RoomId::new("!gone:x")]);
        assert!(h.store.get_room(&RoomId::new("!gone:x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deferred_requests_reach_crypto() {
        let h = harness();
        h.ingestor
            .ingest(
                &batch(json!({
                    "next_batch": "s1",
                    "to_device": {"events": [{
                        "type": "m.secret.request",
                        "sender": "@me:x",
                        "content": {"action": "request", "requesting_device_id": "D", "request_id": "1", "name": "x"}
                    }]}
                })),
                "",
            )
            .await
            .unwrap();

        // The detached task runs on its own schedule.
        for _ in 0..50 {
            if !h.crypto.secret_requests().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.crypto.secret_requests().len(), 1);
    }

    // ===========================================
    // Reprocess Tests
    // ===========================================

    #[tokio::test]
    async fn reprocess_upgrades_stale_local_content() {
        let h = harness();
        h.ingestor
            .ingest(
                &batch(json!({
                    "next_batch": "s1",
                    "rooms": {"join": {"!r:x": {"timeline": {"events": [{
                        "event_id": "$m", "type": "m.room.message", "sender": "@b:x",
                        "origin_server_ts": 5,
                        "content": {"msgtype": "m.text", "body": "see https://example.com"}
                    }]}}}}
                })),
                "",
            )
            .await
            .unwrap();

        let mut stored = h.store.get_event_by_id(&EventId::new("$m")).await.unwrap().unwrap();
        assert!(h.ingestor.reprocess_existing_event(&stored).await.unwrap().is_none());

        if let Some(local) = stored.local_content.as_mut() {
            local.html_version = 0;
        }
        let updated = h
            .ingestor
            .reprocess_existing_event(&stored)
            .await
            .unwrap()
            .unwrap();
        let local = updated.local_content.unwrap();
        assert_eq!(local.html_version, larch_sync_core::CURRENT_SANITIZER_VERSION);
        assert!(local.sanitized_html.contains("<a href=\"https://example.com\""));
    }
}

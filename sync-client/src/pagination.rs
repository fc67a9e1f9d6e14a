//! Backward-pagination registry.
//!
//! At most one pagination task runs per room. Each registration holds a
//! oneshot receiver; ingestion sends an [`InterruptReason`] through it when
//! the room's timeline is reset, so the task drops its page instead of
//! committing it. The entry is removed when the task's guard is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use larch_sync_types::RoomId;

use crate::error::{InterruptReason, SyncProcessingError};

struct Registration {
    id: u64,
    interrupt: oneshot::Sender<InterruptReason>,
}

/// Registry of in-flight pagination tasks, keyed by room.
#[derive(Default)]
pub struct PaginationRegistry {
    active: Mutex<HashMap<RoomId, Registration>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for PaginationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginationRegistry")
            .field("active", &self.active().len())
            .finish()
    }
}

impl PaginationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<RoomId, Registration>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pagination task for `room_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncProcessingError::PaginationInProgress`] if another task
    /// is registered for the room.
    pub fn register(self: &Arc<Self>, room_id: &RoomId) -> Result<PaginationGuard, SyncProcessingError> {
        let mut active = self.active();
        if active.contains_key(room_id) {
            return Err(SyncProcessingError::PaginationInProgress(room_id.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        active.insert(room_id.clone(), Registration { id, interrupt: tx });
        Ok(PaginationGuard {
            registry: Arc::clone(self),
            room_id: room_id.clone(),
            id,
            interrupted: rx,
        })
    }

    /// Cancel the task registered for `room_id`, if any.
    ///
    /// Returns true if a task was signalled. The entry is removed, so a
    /// second call for the same reset does nothing.
    pub fn interrupt(&self, room_id: &RoomId, reason: InterruptReason) -> bool {
        let Some(registration) = self.active().remove(room_id) else {
            return false;
        };
        tracing::debug!("Interrupting pagination in {} ({})", room_id, reason);
        // The task may have finished fetching and dropped its receiver.
        registration.interrupt.send(reason).is_ok()
    }

    /// True if a task is registered for `room_id`.
    pub fn is_active(&self, room_id: &RoomId) -> bool {
        self.active().contains_key(room_id)
    }
}

/// Registration of one pagination task. Unregisters on drop.
pub struct PaginationGuard {
    registry: Arc<PaginationRegistry>,
    room_id: RoomId,
    id: u64,
    interrupted: oneshot::Receiver<InterruptReason>,
}

impl PaginationGuard {
    /// Room being paginated.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Resolve once the task is interrupted. Pending forever if the
    /// registration is dropped without an interrupt.
    pub async fn interrupted(&mut self) -> InterruptReason {
        match (&mut self.interrupted).await {
            Ok(reason) => reason,
            Err(_) => std::future::pending().await,
        }
    }

    /// Non-blocking check for an interrupt that already happened.
    pub fn check(&mut self) -> Result<(), SyncProcessingError> {
        match self.interrupted.try_recv() {
            Ok(reason) => Err(SyncProcessingError::PaginationInterrupted(reason)),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for PaginationGuard {
    fn drop(&mut self) {
        let mut active = self.registry.active();
        if active.get(&self.room_id).is_some_and(|r| r.id == self.id) {
            active.remove(&self.room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::new("!r:x")
    }

    #[test]
    fn second_registration_is_rejected() {
        let registry = Arc::new(PaginationRegistry::new());
        let _guard = registry.register(&room()).unwrap();
        let err = registry.register(&room()).err().unwrap();
        assert!(matches!(err, SyncProcessingError::PaginationInProgress(_)));
    }

    #[test]
    fn drop_unregisters() {
        let registry = Arc::new(PaginationRegistry::new());
        {
            let _guard = registry.register(&room()).unwrap();
            assert!(registry.is_active(&room()));
        }
        assert!(!registry.is_active(&room()));
        assert!(registry.register(&room()).is_ok());
    }

    #[test]
    fn interrupt_signals_once() {
        let registry = Arc::new(PaginationRegistry::new());
        let mut guard = registry.register(&room()).unwrap();

        assert!(registry.interrupt(&room(), InterruptReason::TimelineReset));
        assert!(!registry.interrupt(&room(), InterruptReason::TimelineReset));

        let err = guard.check().unwrap_err();
        assert!(matches!(
            err,
            SyncProcessingError::PaginationInterrupted(InterruptReason::TimelineReset)
        ));
    }

    #[test]
    fn stale_guard_keeps_newer_registration() {
        let registry = Arc::new(PaginationRegistry::new());
        let old = registry.register(&room()).unwrap();
        registry.interrupt(&room(), InterruptReason::TimelineReset);
        let _new = registry.register(&room()).unwrap();

        drop(old);
        assert!(registry.is_active(&room()));
    }

    #[tokio::test]
    async fn interrupted_future_resolves() {
        let registry = Arc::new(PaginationRegistry::new());
        let mut guard = registry.register(&room()).unwrap();
        registry.interrupt(&room(), InterruptReason::TimelineReset);
        assert_eq!(guard.interrupted().await, InterruptReason::TimelineReset);
    }

    #[test]
    fn interrupt_without_task_is_noop() {
        let registry = PaginationRegistry::new();
        assert!(!registry.interrupt(&room(), InterruptReason::TimelineReset));
    }
}

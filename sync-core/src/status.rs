//! Sync status state machine.
//!
//! Pure transitions over [`SyncStatus`]. The caller feeds in the outcome of
//! each ingest call and publishes whatever notification comes back.

use larch_sync_types::SyncStatus;

/// Outcome of one ingest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// The batch was fully processed.
    BatchSucceeded {
        /// Completion time (ms since epoch).
        at: i64,
    },
    /// Processing the batch failed.
    BatchFailed {
        /// Error text.
        error: String,
    },
}

/// Sync status tracker - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatusMachine {
    status: SyncStatus,
    error_count: u32,
    last_sync: Option<i64>,
}

impl SyncStatusMachine {
    /// Create a tracker in the `Waiting` state.
    pub fn new() -> Self {
        Self {
            status: SyncStatus::Waiting,
            error_count: 0,
            last_sync: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> &SyncStatus {
        &self.status
    }

    /// Consecutive failures since the last success.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Time of the last successful batch.
    pub fn last_sync(&self) -> Option<i64> {
        self.last_sync
    }

    /// Process an outcome and return the new tracker plus the status to
    /// publish, if any.
    ///
    /// `Ok -> Ok` publishes nothing. Every failure publishes, because the
    /// error text and counter change.
    pub fn on_event(self, event: StatusEvent) -> (Self, Option<SyncStatus>) {
        match event {
            StatusEvent::BatchSucceeded { at } => {
                let notify = self.status != SyncStatus::Ok;
                let next = Self {
                    status: SyncStatus::Ok,
                    error_count: 0,
                    last_sync: Some(at),
                };
                let emitted = notify.then(|| next.status.clone());
                (next, emitted)
            }
            StatusEvent::BatchFailed { error } => {
                let error_count = self.error_count.saturating_add(1);
                let status = SyncStatus::Errored {
                    error,
                    error_count,
                    last_sync: self.last_sync,
                };
                let next = Self {
                    status: status.clone(),
                    error_count,
                    last_sync: self.last_sync,
                };
                (next, Some(status))
            }
        }
    }
}

impl Default for SyncStatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(error: &str) -> StatusEvent {
        StatusEvent::BatchFailed {
            error: error.to_string(),
        }
    }

    // ===========================================
    // Transition Tests
    // ===========================================

    #[test]
    fn starts_waiting() {
        let machine = SyncStatusMachine::new();
        assert_eq!(machine.status(), &SyncStatus::Waiting);
        assert_eq!(machine.error_count(), 0);
    }

    #[test]
    fn waiting_to_ok_notifies() {
        let (machine, emitted) =
            SyncStatusMachine::new().on_event(StatusEvent::BatchSucceeded { at: 100 });
        assert_eq!(emitted, Some(SyncStatus::Ok));
        assert_eq!(machine.last_sync(), Some(100));
    }

    #[test]
    fn ok_to_ok_is_silent() {
        let (machine, _) =
            SyncStatusMachine::new().on_event(StatusEvent::BatchSucceeded { at: 100 });
        let (machine, emitted) = machine.on_event(StatusEvent::BatchSucceeded { at: 200 });
        assert_eq!(emitted, None);
        assert_eq!(machine.last_sync(), Some(200));
    }

    #[test]
    fn failure_records_error_and_last_sync() {
        let (machine, _) =
            SyncStatusMachine::new().on_event(StatusEvent::BatchSucceeded { at: 100 });
        let (machine, emitted) = machine.on_event(failed("db locked"));
        assert_eq!(
            emitted,
            Some(SyncStatus::Errored {
                error: "db locked".into(),
                error_count: 1,
                last_sync: Some(100),
            })
        );
        assert_eq!(machine.error_count(), 1);
    }

    #[test]
    fn consecutive_failures_each_notify() {
        let machine = SyncStatusMachine::new();
        let (machine, first) = machine.on_event(failed("a"));
        let (machine, second) = machine.on_event(failed("a"));
        assert!(first.is_some());
        match second {
            Some(SyncStatus::Errored { error_count, .. }) => assert_eq!(error_count, 2),
            other => panic!("unexpected status: {:?}", other),
        }
        assert_eq!(machine.error_count(), 2);
    }

    #[test]
    fn success_resets_error_count() {
        let (machine, _) = SyncStatusMachine::new().on_event(failed("a"));
        let (machine, _) = machine.on_event(failed("b"));
        let (machine, emitted) = machine.on_event(StatusEvent::BatchSucceeded { at: 5 });
        assert_eq!(emitted, Some(SyncStatus::Ok));
        assert_eq!(machine.error_count(), 0);
    }
}

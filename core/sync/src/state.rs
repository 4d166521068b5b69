//! Sync state tracking and the status read model.
//!
//! Not persisted: rebuilt at startup from the queue length and an initial
//! connectivity probe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Drain loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    /// Nothing to do, or offline.
    Idle,
    /// Sending queued ops.
    Draining,
    /// Waiting after a transport failure.
    Backoff,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Draining => "draining",
            EngineState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Snapshot of the sync layer for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_count: usize,
    /// Last time the queue was drained empty.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub engine: EngineState,
}

impl SyncStatus {
    fn initial(pending_count: usize) -> Self {
        Self {
            is_online: false,
            pending_count,
            last_sync_at: None,
            last_error: None,
            engine: EngineState::Idle,
        }
    }
}

/// Process-wide sync state. Written by the engine, the scheduler and the
/// network listener; read through [`StatusObserver`].
pub struct SyncState {
    tx: watch::Sender<SyncStatus>,
}

impl SyncState {
    pub fn new(pending_count: usize) -> Self {
        let (tx, _) = watch::channel(SyncStatus::initial(pending_count));
        Self { tx }
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn observer(&self) -> StatusObserver {
        StatusObserver {
            rx: self.tx.subscribe(),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_if_modified(|status| {
            let before = status.clone();
            apply(status);
            *status != before
        });
    }

    pub fn set_online(&self, online: bool) {
        self.update(|s| s.is_online = online);
    }

    pub fn set_pending(&self, count: usize) {
        self.update(|s| s.pending_count = count);
    }

    pub fn set_engine(&self, engine: EngineState) {
        self.update(|s| s.engine = engine);
    }

    pub fn record_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|s| s.last_error = Some(error));
    }

    /// The queue drained empty. A clean pass also clears the last error.
    pub fn mark_synced(&self, clean: bool) {
        self.update(|s| {
            s.last_sync_at = Some(Utc::now());
            if clean {
                s.last_error = None;
            }
        });
    }
}

/// Read-only view of [`SyncStatus`] that can await changes.
#[derive(Clone)]
pub struct StatusObserver {
    rx: watch::Receiver<SyncStatus>,
}

impl StatusObserver {
    pub fn current(&self) -> SyncStatus {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return the new status.
    ///
    /// Returns `None` once the sync service is gone.
    pub async fn changed(&mut self) -> Option<SyncStatus> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until `predicate` holds, returning the matching status.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&SyncStatus) -> bool,
    ) -> Option<SyncStatus> {
        self.rx.wait_for(predicate).await.ok().map(|s| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status() {
        let state = SyncState::new(3);
        let status = state.current();
        assert!(!status.is_online);
        assert_eq!(status.pending_count, 3);
        assert_eq!(status.engine, EngineState::Idle);
        assert!(status.last_sync_at.is_none());
    }

    #[test]
    fn test_mark_synced_clears_error_only_when_clean() {
        let state = SyncState::new(0);
        state.record_error("timeout");

        state.mark_synced(false);
        assert_eq!(state.current().last_error.as_deref(), Some("timeout"));
        assert!(state.current().last_sync_at.is_some());

        state.mark_synced(true);
        assert!(state.current().last_error.is_none());
    }

    #[tokio::test]
    async fn test_observer_sees_changes() {
        let state = SyncState::new(0);
        let mut observer = state.observer();

        state.set_pending(2);
        let status = observer.changed().await.unwrap();
        assert_eq!(status.pending_count, 2);

        state.set_online(true);
        state.set_engine(EngineState::Draining);
        let status = observer
            .wait_for(|s| s.engine == EngineState::Draining)
            .await
            .unwrap();
        assert!(status.is_online);
    }

    #[test]
    fn test_status_serializes() {
        let json = serde_json::to_value(SyncState::new(1).current()).unwrap();
        assert_eq!(json["pending_count"], 1);
        assert_eq!(json["engine"], "Idle");
    }
}

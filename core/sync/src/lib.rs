//! Larder Sync
//!
//! Offline-first synchronization between the local store and the backend:
//! - Optimistic local writes with a durable pending-operation queue
//! - Debounced field updates that collapse into one queued op
//! - Batched queue draining with idempotency keys and server-wins conflicts
//! - Reachability-based network monitoring with exponential backoff
//! - An observable sync status

pub mod clock;
pub mod config;
pub mod conflict;
pub mod context;
pub mod debounce;
pub mod engine;
pub mod events;
pub mod facade;
pub mod network;
pub mod observer;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod state;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use conflict::{ConflictInfo, ConflictResolver, ResolutionResult};
pub use engine::{DrainReport, SyncEngine};
pub use events::RecordEvent;
pub use facade::{DataService, RefreshOutcome, TEMP_ID_PREFIX};
pub use network::{BackendProbe, LinkSignal, NetworkMonitor, ReachabilityProbe};
pub use observer::{Listeners, Subscription};
pub use queue::{EnqueueOutcome, PendingQueue};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncRequest, SyncScheduler};
pub use service::SyncService;
pub use state::{EngineState, StatusObserver, SyncStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _clock = SystemClock;
    }
}

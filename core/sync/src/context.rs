//! State shared by the façade, the engine and the scheduler.

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};

use larder_common::Result;
use larder_remote::RemoteBackend;
use larder_storage::LocalStore;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::debounce::UpdateCoalescer;
use crate::events::{IdAliases, RecordEvent};
use crate::network::{BackendProbe, NetworkMonitor};
use crate::queue::PendingQueue;
use crate::state::SyncState;

/// Capacity of the record event channel; slow subscribers lag.
const EVENT_CAPACITY: usize = 256;

/// Everything the sync components share.
///
/// `gate` is the single-writer lock: hold it around every read-modify-write
/// of the store or the queue, never across a backend call.
pub struct SyncContext {
    pub store: Arc<dyn LocalStore>,
    pub backend: Arc<dyn RemoteBackend>,
    pub queue: PendingQueue,
    pub holds: UpdateCoalescer,
    pub network: NetworkMonitor,
    pub state: SyncState,
    pub aliases: IdAliases,
    pub gate: Mutex<()>,
    pub events: broadcast::Sender<RecordEvent>,
    /// Wakes the scheduler when work is enqueued.
    pub wake: Notify,
}

impl SyncContext {
    /// Open the queue over `store` and wire the shared state.
    pub async fn open(
        store: Arc<dyn LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        config: &SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let queue = PendingQueue::open(store.clone()).await?;
        let pending = queue.count().await?;
        let network = NetworkMonitor::new(
            Arc::new(BackendProbe::new(backend.clone())),
            config.signal_debounce(),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Arc::new(Self {
            holds: UpdateCoalescer::new(clock, config.debounce_window(), config.max_debounce()),
            store,
            backend,
            queue,
            network,
            state: SyncState::new(pending),
            aliases: IdAliases::new(),
            gate: Mutex::new(()),
            events,
            wake: Notify::new(),
        }))
    }

    /// Broadcast a record event. Having no subscribers is fine.
    pub fn emit(&self, event: RecordEvent) {
        let _ = self.events.send(event);
    }

    /// Refresh the pending count in the status.
    pub async fn publish_pending(&self) -> Result<usize> {
        let count = self.queue.count().await?;
        self.state.set_pending(count);
        Ok(count)
    }
}

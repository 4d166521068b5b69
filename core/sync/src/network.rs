//! Network state detection.
//!
//! The monitor keeps a single online/offline flag. Platform link events feed
//! it through [`NetworkMonitor::signal`], but a link-up event alone never
//! flips it online: only a successful reachability probe of the backend
//! does. Link-down events take effect immediately.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

use larder_remote::RemoteBackend;

use crate::observer::{Listeners, Subscription};

/// Link-layer connectivity event reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    Up,
    Down,
}

/// Checks whether the backend can actually be reached.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Probe that pings the backend's base endpoint.
pub struct BackendProbe {
    backend: Arc<dyn RemoteBackend>,
}

impl BackendProbe {
    pub fn new(backend: Arc<dyn RemoteBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ReachabilityProbe for BackendProbe {
    async fn probe(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Reachability probe failed: {}", e);
                false
            }
        }
    }
}

struct MonitorInner {
    probe: Arc<dyn ReachabilityProbe>,
    state: watch::Sender<bool>,
    listeners: Listeners<bool>,
    signal_debounce: Duration,
    /// A delayed probe is scheduled.
    probe_scheduled: AtomicBool,
    /// Bumped by link-down signals to void probes started before them.
    generation: AtomicU64,
}

/// Online/offline monitor. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    /// Create a monitor that starts offline.
    pub fn new(probe: Arc<dyn ReachabilityProbe>, signal_debounce: Duration) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                state,
                listeners: Listeners::new(),
                signal_debounce,
                probe_scheduled: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.state.borrow()
    }

    /// Register a listener called on every online/offline edge.
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.inner.listeners.add(listener)
    }

    /// Receiver that observes every published state.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.state.subscribe()
    }

    /// Probe reachability now and publish the result.
    pub async fn check_now(&self) -> bool {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.probe_since(generation).await
    }

    /// Probe, publishing only if no link-down arrived since `generation`.
    async fn probe_since(&self, generation: u64) -> bool {
        let reachable = self.inner.probe.probe().await;
        if self.inner.generation.load(Ordering::SeqCst) == generation {
            self.publish(reachable);
        }
        self.is_online()
    }

    /// Feed a platform connectivity event.
    ///
    /// `Down` goes offline at once. A burst of `Up` signals inside the
    /// debounce window schedules a single probe.
    pub fn signal(&self, signal: LinkSignal) {
        match signal {
            LinkSignal::Down => {
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                // A probe pending from before the drop is void; the next
                // link-up must schedule its own.
                self.inner.probe_scheduled.store(false, Ordering::SeqCst);
                self.publish(false);
            }
            LinkSignal::Up => {
                if self.inner.probe_scheduled.swap(true, Ordering::SeqCst) {
                    debug!("Link-up signal folded into scheduled probe");
                    return;
                }
                let generation = self.inner.generation.load(Ordering::SeqCst);
                let monitor = self.clone();
                tokio::spawn(async move {
                    sleep(monitor.inner.signal_debounce).await;
                    // The flag now belongs to whichever link-up came after a drop.
                    if monitor.inner.generation.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    monitor.inner.probe_scheduled.store(false, Ordering::SeqCst);
                    monitor.probe_since(generation).await;
                });
            }
        }
    }

    /// Spawn a task that re-probes on a fixed interval.
    pub fn spawn_periodic_probe(&self, every: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.check_now().await;
            }
        })
    }

    /// Publish a new state; listeners only hear about actual edges.
    fn publish(&self, online: bool) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("Network is now {}", if online { "online" } else { "offline" });
            self.inner.listeners.notify(&online);
        }
    }
}

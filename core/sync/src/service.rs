//! Sync service lifecycle.
//!
//! [`SyncService`] owns the shared context, the engine and the background
//! tasks: the scheduler loop, the debounce flush ticker and the periodic
//! reachability probe.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use larder_common::{Error, Result};
use larder_remote::RemoteBackend;
use larder_storage::LocalStore;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::engine::{DrainReport, SyncEngine};
use crate::facade::DataService;
use crate::network::{LinkSignal, NetworkMonitor};
use crate::observer::Subscription;
use crate::scheduler::SyncScheduler;
use crate::state::{StatusObserver, SyncStatus};

struct Running {
    scheduler: SyncScheduler,
    loop_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    _online: Subscription,
}

/// Entry point of the sync layer.
pub struct SyncService {
    config: SyncConfig,
    ctx: Arc<SyncContext>,
    engine: Arc<SyncEngine>,
    data: Arc<DataService>,
    running: Mutex<Option<Running>>,
}

impl SyncService {
    /// Open the service over a store and a backend.
    ///
    /// Ops persisted by an earlier run are picked up from the store.
    pub async fn open(
        store: Arc<dyn LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        config: SyncConfig,
    ) -> Result<Self> {
        Self::open_with_clock(store, backend, config, Arc::new(SystemClock)).await
    }

    /// Open with an explicit clock for the debounce window.
    pub async fn open_with_clock(
        store: Arc<dyn LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            "Opening sync service (store: {}, backend: {})",
            store.name(),
            backend.name()
        );
        let ctx = SyncContext::open(store, backend, &config, clock).await?;
        let engine = Arc::new(SyncEngine::new(ctx.clone(), config.batch_size));
        let data = Arc::new(DataService::new(ctx.clone(), config.retry_config()));

        Ok(Self {
            config,
            ctx,
            engine,
            data,
            running: Mutex::new(None),
        })
    }

    /// Start the background tasks and probe reachability once.
    ///
    /// # Errors
    /// - `Sync` if already started
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Sync("Sync service already started".to_string()));
        }

        let ctx = self.ctx.clone();
        let online = self
            .ctx
            .network
            .on_change(move |online| ctx.state.set_online(*online));
        self.ctx.network.check_now().await;
        self.ctx.state.set_online(self.ctx.network.is_online());

        let (scheduler, run_loop) = SyncScheduler::new(
            self.ctx.clone(),
            self.engine.clone(),
            self.config.retry_config(),
            self.config.periodic_sync(),
        );
        let loop_task = tokio::spawn(run_loop.run());

        let mut tasks = vec![self.spawn_flush_ticker()];
        if let Some(every) = self.config.probe_interval() {
            tasks.push(self.ctx.network.spawn_periodic_probe(every));
        }

        *running = Some(Running {
            scheduler,
            loop_task,
            tasks,
            _online: online,
        });
        info!("Sync service started");
        Ok(())
    }

    fn spawn_flush_ticker(&self) -> JoinHandle<()> {
        let data = self.data.clone();
        let every = self.config.flush_tick();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = data.flush_due().await {
                    error!("Failed to release debounced edits: {}", e);
                }
            }
        })
    }

    /// Release debounced edits and stop the background tasks.
    ///
    /// A batch in flight is finished and applied first. Stopping a service
    /// that is not running only flushes.
    pub async fn stop(&self) -> Result<()> {
        self.data.flush().await?;

        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.scheduler.shutdown().await;
        if let Err(e) = running.loop_task.await {
            error!("Scheduler task failed: {}", e);
        }
        for task in running.tasks {
            task.abort();
        }

        info!("Sync service stopped");
        Ok(())
    }

    /// Release debounced edits and drain now, skipping any backoff wait.
    ///
    /// # Errors
    /// - `Sync` if the service is not started
    /// - `Transport` if the backend is unreachable
    pub async fn sync_now(&self) -> Result<DrainReport> {
        let scheduler = match self.running.lock().await.as_ref() {
            Some(running) => running.scheduler.clone(),
            None => return Err(Error::Sync("Sync service not started".to_string())),
        };
        self.data.flush().await?;
        scheduler.request_sync().await
    }

    /// Drop every cached record and pending op.
    pub async fn purge(&self) -> Result<()> {
        let _gate = self.ctx.gate.lock().await;
        self.ctx.holds.clear()?;
        self.ctx.store.purge().await?;
        self.ctx.queue.reset()?;
        self.ctx.aliases.clear();
        self.data.reset()?;
        self.ctx.publish_pending().await?;
        info!("Purged local data");
        Ok(())
    }

    /// Feed a platform connectivity event.
    pub fn signal(&self, signal: LinkSignal) {
        self.ctx.network.signal(signal);
    }

    pub fn status(&self) -> SyncStatus {
        self.ctx.state.current()
    }

    pub fn observer(&self) -> StatusObserver {
        self.ctx.state.observer()
    }

    pub fn data(&self) -> Arc<DataService> {
        self.data.clone()
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.ctx.network
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

//! Sync scheduling: the drain loop and its triggers.
//!
//! One long-lived task runs the engine state machine:
//!
//! - `Idle` -> `Draining` when online with a non-empty queue. Triggers are
//!   enqueue wake-ups, online transitions, the periodic tick and manual
//!   requests.
//! - `Draining` -> `Backoff` after a transport failure, `Idle` otherwise.
//! - `Backoff` -> `Draining` when the delay elapses, or early on an online
//!   transition or a manual request.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

use larder_common::{Error, Result};

use crate::context::SyncContext;
use crate::engine::{DrainReport, SyncEngine};
use crate::retry::RetryConfig;
use crate::state::EngineState;

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Drain now, skipping any backoff wait.
    Drain(oneshot::Sender<Result<DrainReport>>),
    /// Shutdown the scheduler.
    Shutdown,
}

/// Client side of the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SyncRequest>,
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    /// Create a scheduler and the loop that serves it.
    pub fn new(
        ctx: Arc<SyncContext>,
        engine: Arc<SyncEngine>,
        backoff: RetryConfig,
        periodic: Option<Duration>,
    ) -> (Self, SchedulerLoop) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = Self {
            request_tx,
            shutdown: shutdown.clone(),
        };
        let run_loop = SchedulerLoop {
            ctx,
            engine,
            backoff,
            periodic,
            request_rx,
            shutdown,
        };
        (scheduler, run_loop)
    }

    /// Request a drain and wait for its report.
    pub async fn request_sync(&self) -> Result<DrainReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(SyncRequest::Drain(response_tx))
            .await
            .map_err(|_| Error::Sync("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Sync("Failed to receive sync result".to_string()))?
    }

    /// Ask the loop to exit once the batch in flight (if any) is applied.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.request_tx.send(SyncRequest::Shutdown).await;
    }
}

/// The drain loop. Spawn [`SchedulerLoop::run`] on the runtime.
pub struct SchedulerLoop {
    ctx: Arc<SyncContext>,
    engine: Arc<SyncEngine>,
    backoff: RetryConfig,
    periodic: Option<Duration>,
    request_rx: mpsc::Receiver<SyncRequest>,
    shutdown: Arc<AtomicBool>,
}

impl SchedulerLoop {
    /// Run until shutdown.
    pub async fn run(mut self) {
        let mut online_rx = self.ctx.network.watch();
        let mut periodic = self.periodic.map(|every| {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        let mut backoff: Option<Pin<Box<Sleep>>> = None;
        let mut failures: u32 = 0;

        info!("Sync scheduler started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if backoff.is_none() && self.ctx.network.is_online() && self.has_work().await {
                let (_, delay) = self.drain_pass(&mut failures).await;
                backoff = delay.map(|d| Box::pin(sleep(d)));
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }

            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some(SyncRequest::Drain(response_tx)) => {
                        debug!("Processing manual sync request");
                        failures = 0;
                        let (result, delay) = self.manual_pass(&mut failures).await;
                        backoff = delay.map(|d| Box::pin(sleep(d)));
                        let _ = response_tx.send(result);
                    }
                    Some(SyncRequest::Shutdown) | None => {
                        info!("Received shutdown request");
                        break;
                    }
                },

                _ = self.ctx.wake.notified() => {
                    debug!("Woken by enqueue");
                }

                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && backoff.is_some() {
                        info!("Back online, leaving backoff");
                        backoff = None;
                        failures = 0;
                        self.ctx.state.set_engine(EngineState::Idle);
                    }
                }

                _ = Self::wait_backoff(&mut backoff) => {
                    debug!("Backoff elapsed");
                    backoff = None;
                    self.ctx.state.set_engine(EngineState::Idle);
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    debug!("Periodic sync tick");
                }
            }
        }

        self.ctx.state.set_engine(EngineState::Idle);
        info!("Sync scheduler stopped");
    }

    /// Whether any queued op is sendable now; debounced records wait for
    /// their release to wake the loop.
    async fn has_work(&self) -> bool {
        let sendable = match self.ctx.holds.held() {
            Ok(held) => self.ctx.queue.peek_batch(1, &held).await,
            Err(e) => Err(e),
        };
        match sendable {
            Ok(batch) => !batch.is_empty(),
            Err(e) => {
                error!("Failed to read queue: {}", e);
                false
            }
        }
    }

    /// Drain and return the report plus the backoff delay to wait, if any.
    async fn drain_pass(&self, failures: &mut u32) -> (Result<DrainReport>, Option<Duration>) {
        self.ctx.state.set_engine(EngineState::Draining);
        let result = self.engine.drain(&self.shutdown).await;

        let failed = match &result {
            Ok(report) => report.failed > 0,
            Err(e) => {
                error!("Drain aborted: {}", e);
                self.ctx.state.record_error(e.to_string());
                true
            }
        };

        if failed {
            let delay = self.backoff.delay_for_attempt(*failures);
            *failures = failures.saturating_add(1);
            warn!("Backing off for {:?} after {} failed drains", delay, failures);
            self.ctx.state.set_engine(EngineState::Backoff);
            (result, Some(delay))
        } else {
            *failures = 0;
            self.ctx.state.set_engine(EngineState::Idle);
            (result, None)
        }
    }

    /// A manual request probes first when offline, so it works without
    /// platform link signals.
    async fn manual_pass(&self, failures: &mut u32) -> (Result<DrainReport>, Option<Duration>) {
        if !self.ctx.network.is_online() && !self.ctx.network.check_now().await {
            return (
                Err(Error::Transport("Backend unreachable".to_string())),
                None,
            );
        }
        self.drain_pass(failures).await
    }

    async fn wait_backoff(backoff: &mut Option<Pin<Box<Sleep>>>) {
        match backoff {
            Some(delay) => delay.as_mut().await,
            None => std::future::pending().await,
        }
    }

    async fn wait_for_periodic(periodic: &mut Option<Interval>) {
        match periodic {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

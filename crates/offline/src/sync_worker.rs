//! Background worker driving the sync engine.
//!
//! Triggers:
//! - connectivity restored: drain the queue, then refresh the cache
//! - periodic tick (`sync_interval`): drain if anything is queued, refresh if stale
//! - on-demand requests from [`SyncWorkerHandle::sync_now`]
//!
//! Repeated drain failures back the periodic drain off with the configured
//! [`RetryPolicy`](crate::retry::RetryPolicy). Reconnects and explicit
//! requests ignore the backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::notify::Notification;
use crate::retry::RetryPolicy;
use crate::sync_engine::{SyncEngine, SyncError};

/// Consecutive drain failures and the earliest time the tick may retry.
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    not_before: Option<Instant>,
}

impl Backoff {
    fn record_failure(&mut self, policy: &RetryPolicy) {
        self.failures = self.failures.saturating_add(1);
        let delay = policy.delay_for_attempt(self.failures);
        tracing::debug!(failures = self.failures, ?delay, "backing off periodic drain");
        self.not_before = Some(Instant::now() + delay);
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.not_before = None;
    }

    fn is_waiting(&self) -> bool {
        self.not_before.is_some_and(|at| Instant::now() < at)
    }
}

pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    shutdown: Arc<Notify>,
}

/// Control handle for a running [`SyncWorker`].
#[derive(Debug)]
pub struct SyncWorkerHandle {
    shutdown: Arc<Notify>,
    requests: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SyncWorkerHandle {
    /// Ask for a full sync as soon as possible. Returns `false` if a request
    /// is already waiting.
    pub fn sync_now(&self) -> bool {
        self.requests.try_send(()).is_ok()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the worker and wait for the current pass to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.task.await {
            tracing::warn!("sync worker ended abnormally: {err}");
        }
    }
}

impl SyncWorker {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Spawn the worker loop. Must be called from within a Tokio runtime.
    pub fn start(self) -> SyncWorkerHandle {
        let (requests, mut pending_requests) = mpsc::channel::<()>(1);
        let shutdown = self.shutdown.clone();
        let engine = self.engine;
        // Subscribe before spawning so no transition is missed.
        let mut connectivity = engine.connectivity().watch();

        let task = tokio::spawn(async move {
            let period = engine.config().sync_interval.max(Duration::from_millis(1));
            tracing::info!(interval_secs = period.as_secs_f64(), "sync worker started");

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut backoff = Backoff::default();

            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("sync worker received shutdown signal");
                        break;
                    }
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            tracing::warn!("connectivity monitor dropped, stopping sync worker");
                            break;
                        }
                        let online = connectivity.borrow_and_update().is_online();
                        if online {
                            engine.notify(Notification::Online);
                            backoff.reset();
                            drain(&engine, &mut backoff).await;
                            refresh(&engine).await;
                        } else {
                            engine.notify(Notification::Offline);
                        }
                    }
                    _ = ticker.tick() => {
                        if !engine.connectivity().is_online() {
                            tracing::debug!("skipping periodic sync, offline");
                            continue;
                        }
                        if backoff.is_waiting() {
                            tracing::debug!(failures = backoff.failures, "skipping periodic drain, backing off");
                        } else {
                            match engine.pending_mutations_count().await {
                                Ok(0) => {}
                                Ok(_) => drain(&engine, &mut backoff).await,
                                Err(err) => tracing::warn!("failed to read mutation queue: {err}"),
                            }
                        }
                        match engine.is_refresh_due().await {
                            Ok(true) => refresh(&engine).await,
                            Ok(false) => {}
                            Err(err) => tracing::warn!("failed to read sync metadata: {err}"),
                        }
                    }
                    Some(()) = pending_requests.recv() => {
                        tracing::debug!("on-demand sync requested");
                        drain(&engine, &mut backoff).await;
                        refresh(&engine).await;
                        if let Err(err) = engine.publish_status().await {
                            tracing::warn!("failed to publish sync status: {err}");
                        }
                    }
                }
            }

            tracing::info!("sync worker stopped");
        });

        SyncWorkerHandle {
            shutdown: self.shutdown,
            requests,
            task,
        }
    }
}

async fn drain(engine: &SyncEngine, backoff: &mut Backoff) {
    match engine.sync_pending_mutations().await {
        Ok(summary) if summary.failed_mutations > 0 => {
            backoff.record_failure(&engine.config().retry_backoff);
        }
        Ok(_) => backoff.reset(),
        Err(SyncError::Offline) => tracing::debug!("drain skipped, offline"),
        Err(SyncError::DrainInProgress) => tracing::debug!("drain skipped, already running"),
        Err(err) => {
            tracing::error!("queue drain failed: {err}");
            engine.notify(Notification::SyncFailed {
                message: err.to_string(),
            });
            backoff.record_failure(&engine.config().retry_backoff);
        }
    }
}

async fn refresh(engine: &SyncEngine) {
    match engine.cache_all_data().await {
        Ok(report) => engine.notify(Notification::from_refresh(&report)),
        Err(SyncError::Offline) => tracing::debug!("refresh skipped, offline"),
        Err(SyncError::RefreshInProgress) => tracing::debug!("refresh skipped, already running"),
        Err(err) => {
            tracing::warn!("cache refresh failed: {err}");
            engine.notify(Notification::SyncFailed {
                message: err.to_string(),
            });
        }
    }
}

//! Connectivity tracking.
//!
//! [`ConnectivityMonitor`] is the single source of truth for "are we
//! online". Transitions come from the platform's network signal
//! ([`ConnectivityMonitor::set_online`]) and, optionally, from a periodic
//! backend reachability poller started with
//! [`ConnectivityMonitor::init_listeners`]. Redundant signals are collapsed:
//! subscribers only hear about actual transitions.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::remote::RemoteService;
use crate::types::ConnectivityState;

type Callback = Arc<dyn Fn(bool) + Send + Sync>;

struct PollTask {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

struct Inner {
    online: AtomicBool,
    next_subscriber: AtomicU64,
    subscribers: Mutex<Vec<(u64, Callback)>>,
    state_tx: watch::Sender<ConnectivityState>,
    poller: Mutex<Option<PollTask>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("online", &self.is_online())
            .field("probing", &self.is_probing())
            .finish()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Handle returned by [`ConnectivityMonitor::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Stop receiving transitions.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.subscribers).retain(|(id, _)| *id != self.id);
        }
    }
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::from_online(initially_online));
        Self {
            inner: Arc::new(Inner {
                online: AtomicBool::new(initially_online),
                next_subscriber: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                state_tx,
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectivityState {
        ConnectivityState::from_online(self.is_online())
    }

    /// Report the current network status. Returns `true` if this was a
    /// transition, in which case subscribers are called in subscription order.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.inner.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }

        if online {
            tracing::info!("connectivity restored");
        } else {
            tracing::warn!("connectivity lost");
        }
        self.inner
            .state_tx
            .send_replace(ConnectivityState::from_online(online));

        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<(u64, Callback)> = lock(&self.inner.subscribers).clone();
        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(online))).is_err() {
                tracing::error!(subscriber = id, "connectivity subscriber panicked");
            }
        }
        true
    }

    /// Call `callback(is_online)` on every transition.
    pub fn subscribe(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subscribers).push((id, Arc::new(callback)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Channel view of the state, for async consumers such as the sync worker.
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_probing(&self) -> bool {
        lock(&self.inner.poller).is_some()
    }

    /// Start polling `remote.ping()` every `interval` and report the result.
    ///
    /// Idempotent: returns `false` (and does nothing) if a poller is already
    /// running. Must be called from within a Tokio runtime.
    pub fn init_listeners(&self, remote: Arc<dyn RemoteService>, interval: Duration) -> bool {
        let mut poller = lock(&self.inner.poller);
        if poller.is_some() {
            tracing::debug!("connectivity poller already running");
            return false;
        }

        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {
                        let reachable = matches!(
                            tokio::time::timeout(interval, remote.ping()).await,
                            Ok(Ok(()))
                        );
                        let Some(inner) = weak.upgrade() else { break };
                        ConnectivityMonitor { inner }.set_online(reachable);
                    }
                }
            }
            tracing::debug!("connectivity poller stopped");
        });

        *poller = Some(PollTask { shutdown, handle });
        tracing::info!(interval_secs = interval.as_secs_f64(), "connectivity poller started");
        true
    }

    /// Stop the poller started by [`init_listeners`](Self::init_listeners).
    pub async fn teardown(&self) {
        let task = lock(&self.inner.poller).take();
        if let Some(task) = task {
            task.shutdown.notify_one();
            if let Err(err) = task.handle.await {
                tracing::warn!("connectivity poller ended abnormally: {err}");
            }
        }
    }
}

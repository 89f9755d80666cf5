//! One-way status notifications for the UI (toasts and badges).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{CacheRefreshReport, SyncSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Online,
    Offline,
    /// A write was stored locally and will be sent later.
    SavedOffline { pending: usize },
    /// Current number of queued mutations.
    PendingCount { pending: usize },
    SyncCompleted {
        synced: usize,
        failed: usize,
        deferred: usize,
    },
    CacheRefreshed { records: usize, failed_collections: usize },
    /// Mutations parked until someone retries or discards them.
    NeedsAttention { count: usize },
    SyncFailed { message: String },
}

impl Notification {
    pub fn from_summary(summary: &SyncSummary) -> Self {
        Notification::SyncCompleted {
            synced: summary.synced_mutations,
            failed: summary.failed_mutations,
            deferred: summary.deferred_mutations,
        }
    }

    pub fn from_refresh(report: &CacheRefreshReport) -> Self {
        Notification::CacheRefreshed {
            records: report.total(),
            failed_collections: report.errors.len(),
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            Notification::SyncFailed { .. } | Notification::NeedsAttention { .. } => true,
            Notification::SyncCompleted { failed, .. } => *failed > 0,
            Notification::CacheRefreshed {
                failed_collections, ..
            } => *failed_collections > 0,
            _ => false,
        }
    }
}

impl core::fmt::Display for Notification {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Notification::Online => write!(f, "Back online"),
            Notification::Offline => write!(f, "Offline mode: changes will be synced later"),
            Notification::SavedOffline { pending } => {
                write!(f, "Saved offline ({pending} change(s) waiting to sync)")
            }
            Notification::PendingCount { pending } => write!(f, "{pending} change(s) waiting to sync"),
            Notification::SyncCompleted {
                synced,
                failed,
                deferred,
            } => {
                write!(f, "{synced} change(s) synced")?;
                if *failed > 0 {
                    write!(f, ", {failed} failed")?;
                }
                if *deferred > 0 {
                    write!(f, ", {deferred} postponed")?;
                }
                Ok(())
            }
            Notification::CacheRefreshed {
                records,
                failed_collections,
            } => {
                write!(f, "Offline data refreshed ({records} records)")?;
                if *failed_collections > 0 {
                    write!(f, ", {failed_collections} collection(s) could not be loaded")?;
                }
                Ok(())
            }
            Notification::NeedsAttention { count } => {
                write!(f, "{count} change(s) could not be synced and need attention")
            }
            Notification::SyncFailed { message } => write!(f, "Sync failed: {message}"),
        }
    }
}

/// Fire-and-forget sink for [`Notification`]s.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn notify(&self, notification: Notification) {
        (**self).notify(notification)
    }
}

/// Writes notifications to the log; used when no UI is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        if notification.is_error() {
            tracing::warn!(target: "stockpro::notify", "{notification}");
        } else {
            tracing::info!(target: "stockpro::notify", "{notification}");
        }
    }
}

/// Fans notifications out to any number of UI listeners.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, notification: Notification) {
        // No receivers is fine.
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_messages() {
        let n = Notification::SyncCompleted {
            synced: 3,
            failed: 1,
            deferred: 2,
        };
        assert_eq!(n.to_string(), "3 change(s) synced, 1 failed, 2 postponed");
        assert!(n.is_error());

        let ok = Notification::SyncCompleted {
            synced: 2,
            failed: 0,
            deferred: 0,
        };
        assert_eq!(ok.to_string(), "2 change(s) synced");
        assert!(!ok.is_error());
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::default();
        let mut rx = notifier.subscribe();
        notifier.notify(Notification::PendingCount { pending: 4 });
        assert_eq!(rx.recv().await.unwrap(), Notification::PendingCount { pending: 4 });
    }
}

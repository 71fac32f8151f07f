//! Outbound notifications and the bus that distributes them.
//!
//! Presentation layers subscribe to the [`NotificationBus`] and render what
//! they receive; nothing in the core knows how a notification is displayed.

use crate::drives::DriveInfo;
use crate::session::Phase;
use crate::sync::{BatchSummary, SyncOutcome};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Everything the core reports to the outside world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Notification {
    /// The set of mounted backup-eligible volumes changed
    DrivesChanged { drives: Vec<DriveInfo> },
    /// A debounced batch was flushed by the watcher, before filtering
    FileChanged { paths: Vec<PathBuf> },
    /// The engine took a batch, including previously deferred paths
    BatchStarted { paths: Vec<PathBuf> },
    /// A file was copied to the backup target
    FileSynced { path: PathBuf },
    /// Terminal result for one path, including ignored and failed ones
    SyncOutcome(SyncOutcome),
    /// Emitted once per batch, after all of its outcomes
    BatchProcessed(BatchSummary),
    /// The backup target could not be reached; the batch was kept for retry
    DestinationUnavailable {
        backup_target: PathBuf,
        reason: String,
        deferred: usize,
    },
    /// The watcher subscription died and the session returned to idle
    WatcherFailed { reason: String },
    PhaseChanged { phase: Phase },
}

/// Fan-out bus for [`Notification`]s.
///
/// Every subscriber owns an unbounded queue, so a slow reader delays only
/// itself and never loses an outcome.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Notification>>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the number of subscribers that received the notification.
    /// Having no subscribers is not an error.
    pub fn publish(&self, notification: Notification) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Dropped receivers unsubscribe themselves
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

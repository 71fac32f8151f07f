//! Recursive observation of the watch root.
//!
//! Raw `notify` events are translated into [`ChangeEvent`]s, coalesced by a
//! [`Debouncer`] running on a tokio task, and delivered as [`ChangeBatch`]es.

pub mod debounce;

pub use debounce::{ChangeBatch, ChangeEvent, ChangeKind, Debouncer};

use crate::config::WatcherConfig;
use crate::{Error, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Output of a running watcher
#[derive(Debug)]
pub enum WatchMessage {
    Batch(ChangeBatch),
    /// The subscription can no longer deliver events
    Failed(String),
}

/// Translate one `notify` event. Renames become a removal of the old path
/// and a creation of the new one.
pub fn change_events(event: &notify::Event) -> Vec<ChangeEvent> {
    let single = |kind: ChangeKind| -> Vec<ChangeEvent> {
        event
            .paths
            .iter()
            .map(|path| ChangeEvent::new(path.clone(), kind))
            .collect()
    };

    match &event.kind {
        EventKind::Create(_) => single(ChangeKind::Created),
        EventKind::Remove(_) => single(ChangeKind::Removed),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => single(ChangeKind::Removed),
            RenameMode::To => single(ChangeKind::Created),
            RenameMode::Both => {
                let mut events = Vec::with_capacity(2);
                if let Some(from) = event.paths.first() {
                    events.push(ChangeEvent::new(from.clone(), ChangeKind::Removed));
                }
                if let Some(to) = event.paths.get(1) {
                    events.push(ChangeEvent::new(to.clone(), ChangeKind::Created));
                }
                events
            }
            _ => single(ChangeKind::Renamed),
        },
        EventKind::Modify(_) | EventKind::Any => single(ChangeKind::Modified),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}

/// A live subscription on one directory tree
pub struct ChangeWatcher {
    root: PathBuf,
    // Dropping the watcher ends the OS subscription
    _watcher: RecommendedWatcher,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ChangeWatcher {
    /// Subscribe to `root` recursively. Directories created later are picked
    /// up by the backend without restarting.
    pub fn start(
        root: &Path,
        config: &WatcherConfig,
        tx: mpsc::UnboundedSender<WatchMessage>,
        token: CancellationToken,
    ) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            Error::configuration(format!("Cannot watch {}: {}", root.display(), e))
        })?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = raw_tx.send(res);
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        info!("Watching {}", root.display());

        let task = tokio::spawn(debounce_loop(
            root.clone(),
            raw_rx,
            tx,
            config.debounce(),
            config.max_hold(),
            token.clone(),
        ));

        Ok(Self {
            root,
            _watcher: watcher,
            token,
            task,
        })
    }

    /// Canonical form of the watched root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cancel the subscription and wait for the debounce task to exit.
    /// Events still pending in the window are discarded.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Debounce task ended abnormally: {}", e);
        }
        info!("Stopped watching {}", self.root.display());
    }
}

async fn debounce_loop(
    root: PathBuf,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    tx: mpsc::UnboundedSender<WatchMessage>,
    window: Duration,
    max_hold: Duration,
    token: CancellationToken,
) {
    let mut debouncer = Debouncer::new(window, max_hold);

    loop {
        let deadline = debouncer.deadline();
        let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = token.cancelled() => break,
            raw = raw_rx.recv() => match raw {
                Some(Ok(event)) => {
                    if event.need_rescan() {
                        // Events were lost; the root stands in for the whole tree
                        warn!("Watcher requested a rescan of {}", root.display());
                        debouncer.push(ChangeEvent::new(root.clone(), ChangeKind::Modified), Instant::now());
                    }
                    for change in change_events(&event) {
                        debouncer.push(change, Instant::now());
                    }
                }
                Some(Err(e)) => {
                    if root.exists() {
                        warn!("Watch error on {}: {}", root.display(), e);
                    } else {
                        error!("Watch root {} disappeared: {}", root.display(), e);
                        let _ = tx.send(WatchMessage::Failed(format!(
                            "watch root {} is no longer available: {}",
                            root.display(),
                            e
                        )));
                        break;
                    }
                }
                None => {
                    let _ = tx.send(WatchMessage::Failed("watcher event channel closed".to_string()));
                    break;
                }
            },
            _ = sleep_until(wake_at), if deadline.is_some() => {
                if let Some(batch) = debouncer.flush() {
                    debug!("Flushing batch of {} paths", batch.len());
                    if tx.send(WatchMessage::Batch(batch)).is_err() {
                        break;
                    }
                }
            }
        }
    }

    if debouncer.pending_len() > 0 {
        debug!(
            "Discarding {} pending paths on shutdown",
            debouncer.pending_len()
        );
    }
}

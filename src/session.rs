//! Session controller: lifecycle, targets and the watch → filter → sync pipeline.
//!
//! All state transitions and batch processing go through one async lock, so
//! `stop` waits for an in-flight batch to finish instead of cutting copies
//! short.

use crate::config::{ConfigStore, IgnoreConfig, SyncConfig};
use crate::drives::{DriveInfo, DriveMonitor, DriveSource};
use crate::events::{Notification, NotificationBus};
use crate::filter::IgnoreFilter;
use crate::sync::{resolve_target, SyncEngine, SyncJob, SyncStatus};
use crate::watcher::{ChangeBatch, ChangeKind, ChangeWatcher, WatchMessage};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Watching,
}

/// Snapshot of the session's targets and phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub watch_target: Option<PathBuf>,
    pub backup_target: Option<PathBuf>,
    pub phase: Phase,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            watch_target: None,
            backup_target: None,
            phase: Phase::Idle,
        }
    }
}

struct Inner {
    state: SessionState,
    config: SyncConfig,
    watcher: Option<ChangeWatcher>,
    session_token: Option<CancellationToken>,
    pipeline: Option<JoinHandle<()>>,
    /// Paths held back while the destination is unreachable
    deferred: ChangeBatch,
    destination_down: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    bus: NotificationBus,
    engine: SyncEngine,
    retry: Notify,
}

struct DriveTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Orchestrates the drive monitor, change watcher, filter and sync engine
pub struct SessionController {
    shared: Arc<Shared>,
    store: Arc<dyn ConfigStore>,
    drives: DriveMonitor,
    lifetime: CancellationToken,
    drive_task: StdMutex<Option<DriveTask>>,
}

impl SessionController {
    /// Load the configuration from `store` and build an idle controller
    pub fn new(store: Arc<dyn ConfigStore>, drive_source: Arc<dyn DriveSource>) -> Result<Self> {
        let config = store.load()?;
        Ok(Self::with_config(config, store, drive_source))
    }

    pub fn with_config(
        config: SyncConfig,
        store: Arc<dyn ConfigStore>,
        drive_source: Arc<dyn DriveSource>,
    ) -> Self {
        let drives = DriveMonitor::new(drive_source, config.drives.clone());
        let engine = SyncEngine::new(config.backup.max_parallel_copies);

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::default(),
                    config,
                    watcher: None,
                    session_token: None,
                    pipeline: None,
                    deferred: ChangeBatch::new(),
                    destination_down: false,
                }),
                bus: NotificationBus::new(),
                engine,
                retry: Notify::new(),
            }),
            store,
            drives,
            lifetime: CancellationToken::new(),
            drive_task: StdMutex::new(None),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.shared.bus.subscribe()
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.shared.bus
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state.clone()
    }

    /// On-demand drive snapshot
    pub fn get_drives(&self) -> Result<Vec<DriveInfo>> {
        self.drives.snapshot()
    }

    /// Start publishing `DrivesChanged`. Does nothing if already running.
    pub fn start_drive_monitor(&self) {
        let mut slot = self.drive_task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return;
        }

        let token = self.lifetime.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = self.drives.spawn(tx, token.clone());
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            while let Some(drives) = rx.recv().await {
                shared.bus.publish(Notification::DrivesChanged { drives });
                // A volume may have come back
                shared.retry.notify_one();
            }
            let _ = monitor.await;
        });

        *slot = Some(DriveTask { token, handle });
    }

    pub async fn stop_drive_monitor(&self) {
        let task = self
            .drive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.handle.await;
        }
    }

    /// Set the backup target to `chosen / <backup folder>`
    pub async fn set_backup_path(&self, chosen: impl AsRef<Path>) -> Result<PathBuf> {
        let chosen = chosen.as_ref();
        if !chosen.is_absolute() {
            return Err(Error::configuration(format!(
                "backup path {} must be absolute",
                chosen.display()
            )));
        }
        let target = {
            let inner = self.shared.inner.lock().await;
            inner.config.backup.backup_target_for(chosen)
        };
        self.set_backup_target(target).await
    }

    /// Takes effect from the next batch; nothing already synced is re-copied.
    /// Returns the target in the resolved form used for matching event paths.
    pub async fn set_backup_target(&self, target: impl Into<PathBuf>) -> Result<PathBuf> {
        let target = target.into();
        if !target.is_absolute() {
            return Err(Error::configuration(format!(
                "backup target {} must be absolute",
                target.display()
            )));
        }
        // Event paths are canonical; the target must be too or it would not
        // recognise its own output when it sits inside the watch root
        let target = resolve_target(&target);

        let mut inner = self.shared.inner.lock().await;
        info!("Backup target set to {}", target.display());
        inner.state.backup_target = Some(target.clone());
        inner.destination_down = false;
        drop(inner);

        self.shared.retry.notify_one();
        Ok(target)
    }

    pub async fn get_config(&self) -> IgnoreConfig {
        self.shared.inner.lock().await.config.ignore.clone()
    }

    pub async fn sync_config(&self) -> SyncConfig {
        self.shared.inner.lock().await.config.clone()
    }

    /// Replace the ignore configuration in memory, effective from the next batch
    pub async fn set_ignore_config(&self, config: IgnoreConfig) {
        let mut inner = self.shared.inner.lock().await;
        inner.config.ignore = config.normalized();
    }

    /// Replace the ignore configuration and persist it
    pub async fn save_config(&self, config: IgnoreConfig) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        inner.config.ignore = config.normalized();
        self.store.save(&inner.config)
    }

    pub async fn add_ignored_extension(&self, extension: &str) -> Result<bool> {
        let mut inner = self.shared.inner.lock().await;
        let added = inner.config.ignore.add_extension(extension)?;
        if added {
            self.store.save(&inner.config)?;
        }
        Ok(added)
    }

    pub async fn remove_ignored_extension(&self, extension: &str) -> Result<bool> {
        let mut inner = self.shared.inner.lock().await;
        let removed = inner.config.ignore.remove_extension(extension);
        if removed {
            self.store.save(&inner.config)?;
        }
        Ok(removed)
    }

    /// Idle → Watching. Requires an existing, readable watch directory and a
    /// backup target.
    pub async fn start(&self, watch_target: impl AsRef<Path>) -> Result<()> {
        let watch_target = watch_target.as_ref();
        let mut inner = self.shared.inner.lock().await;

        if inner.state.phase == Phase::Watching {
            return Err(Error::InvalidState {
                reason: "already watching".to_string(),
            });
        }
        if !watch_target.is_dir() {
            return Err(Error::configuration(format!(
                "watch target {} is not a directory",
                watch_target.display()
            )));
        }
        std::fs::read_dir(watch_target).map_err(|e| {
            Error::configuration(format!(
                "watch target {} is not readable: {}",
                watch_target.display(),
                e
            ))
        })?;
        if inner.state.backup_target.is_none() {
            return Err(Error::configuration("no backup target selected"));
        }

        let token = self.lifetime.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = ChangeWatcher::start(watch_target, &inner.config.watcher, tx.clone(), token.clone())?;
        let root = watcher.root().to_path_buf();

        if inner.config.backup.initial_sync {
            let mut everything = ChangeBatch::new();
            everything.insert(root.clone(), ChangeKind::Modified);
            let _ = tx.send(WatchMessage::Batch(everything));
        }

        let retry_every = inner.config.backup.retry_interval();
        let pipeline = tokio::spawn(run_pipeline(
            Arc::clone(&self.shared),
            rx,
            token.clone(),
            retry_every,
        ));

        inner.state.watch_target = Some(root.clone());
        inner.state.phase = Phase::Watching;
        inner.watcher = Some(watcher);
        inner.session_token = Some(token);
        inner.pipeline = Some(pipeline);
        inner.deferred = ChangeBatch::new();
        inner.destination_down = false;
        drop(inner);

        info!("Session started on {}", root.display());
        self.shared.bus.publish(Notification::PhaseChanged {
            phase: Phase::Watching,
        });
        Ok(())
    }

    /// Watching → Idle. Waits for the batch being processed, if any, and
    /// stops the drive monitor; `start_drive_monitor` restarts it.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.phase == Phase::Idle {
            return Ok(());
        }

        if let Some(token) = inner.session_token.take() {
            token.cancel();
        }
        if let Some(watcher) = inner.watcher.take() {
            watcher.stop().await;
        }
        if !inner.deferred.is_empty() {
            warn!(
                "Dropping {} deferred paths on stop",
                inner.deferred.len()
            );
            inner.deferred = ChangeBatch::new();
        }
        inner.state.phase = Phase::Idle;
        let pipeline = inner.pipeline.take();
        drop(inner);

        // The pipeline may be waiting on the lock; it sees the cancelled token once it gets it
        if let Some(pipeline) = pipeline {
            let _ = pipeline.await;
        }
        self.stop_drive_monitor().await;

        info!("Session stopped");
        self.shared.bus.publish(Notification::PhaseChanged { phase: Phase::Idle });
        Ok(())
    }

    /// Stop everything, including a drive monitor started while idle
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await?;
        self.lifetime.cancel();
        self.stop_drive_monitor().await;
        Ok(())
    }
}

async fn run_pipeline(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<WatchMessage>,
    token: CancellationToken,
    retry_every: std::time::Duration,
) {
    let mut retry_ticker = interval(retry_every);
    retry_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            message = rx.recv() => match message {
                Some(WatchMessage::Batch(batch)) => {
                    shared.bus.publish(Notification::FileChanged { paths: batch.paths() });
                    process_batch(&shared, batch, &token).await;
                }
                Some(WatchMessage::Failed(reason)) => {
                    fail_session(&shared, reason, &token).await;
                    break;
                }
                None => break,
            },
            _ = shared.retry.notified() => {
                process_batch(&shared, ChangeBatch::new(), &token).await;
            }
            _ = retry_ticker.tick() => {
                process_batch(&shared, ChangeBatch::new(), &token).await;
            }
        }
    }

    debug!("Pipeline exited");
}

/// Sync `batch` together with anything deferred earlier
async fn process_batch(shared: &Shared, batch: ChangeBatch, token: &CancellationToken) {
    let mut inner = shared.inner.lock().await;
    if token.is_cancelled() || inner.state.phase != Phase::Watching {
        return;
    }

    let mut pending = std::mem::take(&mut inner.deferred);
    pending.merge(batch);
    if pending.is_empty() {
        return;
    }

    let (Some(watch_root), Some(backup_target)) = (
        inner.state.watch_target.clone(),
        inner.state.backup_target.clone(),
    ) else {
        inner.deferred = pending;
        return;
    };

    // Read once; later config changes apply to the next batch
    let filter = IgnoreFilter::new(inner.config.ignore.clone())
        .with_watch_root(&watch_root)
        .with_backup_target(Some(backup_target.clone()));
    let job = SyncJob {
        watch_root,
        backup_target: backup_target.clone(),
        paths: pending.paths(),
        filter,
    };

    let bus = &shared.bus;
    bus.publish(Notification::BatchStarted {
        paths: job.paths.clone(),
    });
    let result = shared
        .engine
        .run(job, |outcome| {
            bus.publish(Notification::SyncOutcome(outcome.clone()));
            if outcome.status == SyncStatus::Copied {
                bus.publish(Notification::FileSynced {
                    path: outcome.path.clone(),
                });
            }
        })
        .await;

    match result {
        Ok(report) => {
            if inner.destination_down {
                info!("Backup target {} is reachable again", backup_target.display());
                inner.destination_down = false;
            }
            bus.publish(Notification::BatchProcessed(report.summary));
        }
        Err(Error::DestinationUnavailable { path, reason }) => {
            let deferred = pending.len();
            inner.deferred = pending;
            if !inner.destination_down {
                warn!(
                    "Backup target {} unavailable ({}); deferring {} paths",
                    path.display(),
                    reason,
                    deferred
                );
                inner.destination_down = true;
                bus.publish(Notification::DestinationUnavailable {
                    backup_target: path,
                    reason,
                    deferred,
                });
            }
        }
        Err(e) => {
            warn!("Batch could not be processed, deferring: {}", e);
            inner.deferred = pending;
        }
    }
}

async fn fail_session(shared: &Shared, reason: String, token: &CancellationToken) {
    error!("Watcher failed: {}", reason);
    token.cancel();

    let mut inner = shared.inner.lock().await;
    inner.session_token = None;
    inner.pipeline = None;
    inner.deferred = ChangeBatch::new();
    inner.state.phase = Phase::Idle;
    if let Some(watcher) = inner.watcher.take() {
        watcher.stop().await;
    }
    drop(inner);

    shared.bus.publish(Notification::WatcherFailed { reason });
    shared.bus.publish(Notification::PhaseChanged { phase: Phase::Idle });
}

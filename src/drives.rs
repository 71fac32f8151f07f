//! Discovery of mounted volumes that can receive backups.
//!
//! The [`DriveMonitor`] polls a [`DriveSource`] and reports a fresh snapshot
//! whenever the set of mount points changes. Free-space changes alone are
//! not reported.

use crate::config::DriveConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshot of one mounted volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveInfo {
    pub name: String,
    pub mount_point: PathBuf,
    pub total_space: u64,
    pub available_space: u64,
    pub is_removable: bool,
    pub file_system: String,
}

/// Mount points that belong to the operating system itself
const SYSTEM_MOUNT_POINTS: &[&str] = &["/", "/boot", "/boot/efi", "/efi", "/System/Volumes/Data"];

/// Filesystems that never make sense as a backup destination
const PSEUDO_FILE_SYSTEMS: &[&str] = &[
    "tmpfs", "devtmpfs", "squashfs", "overlay", "proc", "sysfs", "autofs", "ramfs",
];

const NETWORK_FILE_SYSTEMS: &[&str] = &[
    "nfs", "nfs4", "cifs", "smbfs", "smb2", "smb3", "afpfs", "sshfs", "fuse.sshfs", "davfs",
    "webdav", "9p",
];

impl DriveInfo {
    pub fn is_network(&self) -> bool {
        NETWORK_FILE_SYSTEMS.contains(&self.file_system.to_lowercase().as_str())
    }

    pub fn is_system(&self) -> bool {
        if SYSTEM_MOUNT_POINTS
            .iter()
            .any(|system| self.mount_point == Path::new(system))
        {
            return true;
        }

        if self.mount_point.starts_with("/System/Volumes") || self.mount_point.starts_with("/snap") {
            return true;
        }

        if PSEUDO_FILE_SYSTEMS.contains(&self.file_system.to_lowercase().as_str()) {
            return true;
        }

        // Windows: the volume holding %SystemDrive%
        match std::env::var("SystemDrive") {
            Ok(system_drive) if !system_drive.is_empty() => self
                .mount_point
                .to_string_lossy()
                .to_uppercase()
                .starts_with(&system_drive.to_uppercase()),
            _ => false,
        }
    }
}

/// Source of raw volume listings
pub trait DriveSource: Send + Sync {
    fn enumerate(&self) -> Result<Vec<DriveInfo>>;
}

/// Enumerates volumes through `sysinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoDrives;

impl DriveSource for SysinfoDrives {
    fn enumerate(&self) -> Result<Vec<DriveInfo>> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        Ok(disks
            .list()
            .iter()
            .map(|disk| DriveInfo {
                name: disk.name().to_string_lossy().to_string(),
                mount_point: disk.mount_point().to_path_buf(),
                total_space: disk.total_space(),
                available_space: disk.available_space(),
                is_removable: disk.is_removable(),
                file_system: disk.file_system().to_string_lossy().to_string(),
            })
            .collect())
    }
}

/// Keep only volumes eligible as backup destinations, sorted by mount point
pub fn eligible_drives(drives: Vec<DriveInfo>, include_network: bool) -> Vec<DriveInfo> {
    let mut seen = BTreeSet::new();
    let mut eligible: Vec<DriveInfo> = drives
        .into_iter()
        .filter(|drive| drive.mount_point.is_absolute())
        .filter(|drive| !drive.is_system())
        .filter(|drive| include_network || !drive.is_network())
        // Bind mounts can list the same mount point twice
        .filter(|drive| seen.insert(drive.mount_point.clone()))
        .collect();

    eligible.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
    eligible
}

/// Remembers the last reported mount-point set
#[derive(Debug, Default)]
pub struct DriveTracker {
    last: Option<BTreeSet<PathBuf>>,
}

impl DriveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the snapshot if its mount-point set differs from the previous
    /// one. The first observation is always reported.
    pub fn observe(&mut self, drives: Vec<DriveInfo>) -> Option<Vec<DriveInfo>> {
        let mounts: BTreeSet<PathBuf> = drives.iter().map(|d| d.mount_point.clone()).collect();
        if self.last.as_ref() == Some(&mounts) {
            return None;
        }
        self.last = Some(mounts);
        Some(drives)
    }
}

/// Polls for volume changes
#[derive(Clone)]
pub struct DriveMonitor {
    source: Arc<dyn DriveSource>,
    config: DriveConfig,
}

impl DriveMonitor {
    pub fn new(source: Arc<dyn DriveSource>, config: DriveConfig) -> Self {
        Self { source, config }
    }

    /// On-demand snapshot of eligible volumes
    pub fn snapshot(&self) -> Result<Vec<DriveInfo>> {
        let drives = self.source.enumerate()?;
        Ok(eligible_drives(drives, self.config.include_network))
    }

    /// Run the polling loop on a new task. Each call starts a fresh sequence
    /// whose first element is the current snapshot.
    pub fn spawn(
        &self,
        tx: mpsc::UnboundedSender<Vec<DriveInfo>>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run(tx, token).await })
    }

    async fn run(self, tx: mpsc::UnboundedSender<Vec<DriveInfo>>, token: CancellationToken) {
        let mut tracker = DriveTracker::new();
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Drive monitor started (every {:?})",
            self.config.poll_interval()
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let monitor = self.clone();
            let snapshot = match tokio::task::spawn_blocking(move || monitor.snapshot()).await {
                Ok(Ok(drives)) => drives,
                Ok(Err(e)) => {
                    warn!("Drive enumeration failed, retrying next tick: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!("Drive enumeration task failed, retrying next tick: {}", e);
                    continue;
                }
            };

            if let Some(drives) = tracker.observe(snapshot) {
                debug!("Mounted volume set changed: {} eligible", drives.len());
                if tx.send(drives).is_err() {
                    break;
                }
            }
        }

        info!("Drive monitor stopped");
    }
}

//! Incremental one-way copy from the watch root to the backup target.
//!
//! The engine never deletes or truncates anything in the backup target: a
//! missing source is reported and skipped, and every copy is written to a
//! sibling temporary file that is renamed over the destination only once it
//! is complete.

use crate::filter::IgnoreFilter;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

/// Candidate timestamp resolutions, finest first. FAT stores 2 s steps.
const RESOLUTIONS_NS: &[u64] = &[
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    2_000_000_000,
];

/// Written to the probe file to measure how the target stores timestamps
const PROBE_MTIME: Duration = Duration::new(1_700_000_001, 987_654_321);

const PARTIAL_SUFFIX: &str = "tether-partial";

/// Result of processing one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Copied,
    SkippedUnchanged,
    /// Filtered out, or gone before it could be copied
    SkippedIgnored,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub path: PathBuf,
    pub status: SyncStatus,
}

impl SyncOutcome {
    pub fn new(path: impl Into<PathBuf>, status: SyncStatus) -> Self {
        Self {
            path: path.into(),
            status,
        }
    }

    pub fn ignored(path: impl Into<PathBuf>) -> Self {
        Self::new(path, SyncStatus::SkippedIgnored)
    }
}

/// Aggregate counts for one processed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub copied: usize,
    pub unchanged: usize,
    pub ignored: usize,
    pub failed: usize,
    pub bytes_copied: u64,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl BatchSummary {
    fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            copied: 0,
            unchanged: 0,
            ignored: 0,
            failed: 0,
            bytes_copied: 0,
            duration_ms: 0,
            finished_at: Utc::now(),
        }
    }

    fn record(&mut self, status: &SyncStatus) {
        match status {
            SyncStatus::Copied => self.copied += 1,
            SyncStatus::SkippedUnchanged => self.unchanged += 1,
            SyncStatus::SkippedIgnored => self.ignored += 1,
            SyncStatus::Failed(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.copied + self.unchanged + self.ignored + self.failed
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub outcomes: Vec<SyncOutcome>,
    pub summary: BatchSummary,
}

/// Everything one batch needs, captured once when the batch starts
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub watch_root: PathBuf,
    pub backup_target: PathBuf,
    pub paths: Vec<PathBuf>,
    pub filter: IgnoreFilter,
}

/// Work after directory expansion
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub files: Vec<PathBuf>,
    pub ignored: Vec<PathBuf>,
}

/// Serializes copies that target the same destination path
#[derive(Debug, Clone, Default)]
struct PathLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PathLocks {
    async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(path.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn release(&self, path: &Path) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = map.get(path) {
            // Only the map still holds it
            if Arc::strong_count(lock) == 1 {
                map.remove(path);
            }
        }
    }

    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Copies changed files into the backup target
#[derive(Debug, Clone)]
pub struct SyncEngine {
    max_parallel: usize,
    locks: PathLocks,
}

impl SyncEngine {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            locks: PathLocks::default(),
        }
    }

    /// Make sure the backup target exists and accepts writes. Only the final
    /// folder is created: if its parent (the drive) is gone, nothing is
    /// created on whatever volume now sits at that path.
    ///
    /// Returns the resolution at which the target stores modification times
    /// (`Duration::ZERO` when exact).
    pub fn validate_destination(target: &Path) -> Result<Duration> {
        let unavailable = |reason: String| Error::DestinationUnavailable {
            path: target.to_path_buf(),
            reason,
        };

        if !target.exists() {
            match target.parent() {
                Some(parent) if parent.is_dir() => {
                    fs::create_dir(target).or_else(|e| {
                        if e.kind() == io::ErrorKind::AlreadyExists {
                            Ok(())
                        } else {
                            Err(unavailable(format!("cannot create backup folder: {}", e)))
                        }
                    })?;
                    info!("Created backup folder {}", target.display());
                }
                _ => return Err(unavailable("volume is not mounted".to_string())),
            }
        }

        if !target.is_dir() {
            return Err(unavailable("not a directory".to_string()));
        }

        let probe = target.join(format!(".tether-probe-{}", Uuid::new_v4()));
        let measured = fs::File::create(&probe)
            .map_err(|e| unavailable(format!("not writable: {}", e)))
            .map(|file| measure_resolution(&file));
        if let Err(e) = fs::remove_file(&probe) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove probe file {}: {}", probe.display(), e);
            }
        }
        measured
    }

    /// Expand directories into the files they contain and apply the filter
    /// to everything discovered along the way.
    pub fn plan(paths: &[PathBuf], filter: &IgnoreFilter) -> SyncPlan {
        let mut plan = SyncPlan::default();
        let mut seen = HashSet::new();

        for path in paths {
            if filter.should_ignore(path) {
                if seen.insert(path.clone()) {
                    plan.ignored.push(path.clone());
                }
                continue;
            }

            if path.is_dir() {
                for file in walk_files(path, filter) {
                    if seen.insert(file.clone()) {
                        plan.files.push(file);
                    }
                }
            } else if seen.insert(path.clone()) {
                plan.files.push(path.clone());
            }
        }

        plan
    }

    /// Every non-ignored file under `watch_root`
    pub fn plan_tree(watch_root: &Path, filter: &IgnoreFilter) -> Vec<PathBuf> {
        walk_files(watch_root, filter)
    }

    /// Process one batch. `on_outcome` sees every outcome as soon as it is
    /// known; the returned summary is complete only after all of them.
    /// Fails as a whole only when the destination is unavailable.
    pub async fn run<F>(&self, job: SyncJob, mut on_outcome: F) -> Result<BatchReport>
    where
        F: FnMut(&SyncOutcome),
    {
        let batch_id = Uuid::new_v4();
        let span = info_span!("sync_batch", batch = %batch_id, paths = job.paths.len());

        async move {
            let started = Instant::now();
            let backup_target = job.backup_target.clone();
            let resolution =
                tokio::task::spawn_blocking(move || Self::validate_destination(&backup_target))
                    .await
                    .map_err(|e| Error::DestinationUnavailable {
                        path: job.backup_target.clone(),
                        reason: format!("validation task failed: {}", e),
                    })??;
            debug!("Backup target timestamp resolution: {:?}", resolution);

            let mut summary = BatchSummary::new(batch_id);

            let plan = {
                let paths = job.paths.clone();
                let filter = job.filter.clone();
                tokio::task::spawn_blocking(move || Self::plan(&paths, &filter)).await
            };
            let plan = match plan {
                Ok(plan) => plan,
                Err(e) => {
                    // Every requested path still gets a terminal outcome
                    warn!("Planning failed: {}", e);
                    let reason = format!("planning failed: {}", e);
                    let mut outcomes = Vec::with_capacity(job.paths.len());
                    for path in job.paths {
                        let outcome = SyncOutcome::new(path, SyncStatus::Failed(reason.clone()));
                        summary.record(&outcome.status);
                        on_outcome(&outcome);
                        outcomes.push(outcome);
                    }
                    summary.duration_ms = started.elapsed().as_millis() as u64;
                    summary.finished_at = Utc::now();
                    return Ok(BatchReport { outcomes, summary });
                }
            };

            let mut outcomes = Vec::with_capacity(plan.files.len() + plan.ignored.len());

            for path in plan.ignored {
                let outcome = SyncOutcome::ignored(path);
                debug!("Ignored {}", outcome.path.display());
                summary.record(&outcome.status);
                on_outcome(&outcome);
                outcomes.push(outcome);
            }

            let semaphore = Arc::new(Semaphore::new(self.max_parallel));
            let watch_root = Arc::new(job.watch_root);
            let backup_target = Arc::new(job.backup_target);
            let mut tasks = JoinSet::new();
            let mut unfinished: HashSet<PathBuf> = plan.files.iter().cloned().collect();

            for source in plan.files {
                let semaphore = Arc::clone(&semaphore);
                let watch_root = Arc::clone(&watch_root);
                let backup_target = Arc::clone(&backup_target);
                let locks = self.locks.clone();

                tasks.spawn(async move {
                    let destination = match destination_for(&source, &watch_root, &backup_target) {
                        Ok(destination) => destination,
                        Err(reason) => {
                            return (SyncOutcome::new(source, SyncStatus::Failed(reason)), 0)
                        }
                    };

                    let _permit = semaphore.acquire_owned().await.ok();
                    let guard = locks.acquire(&destination).await;

                    let src = source.clone();
                    let dst = destination.clone();
                    let result =
                        tokio::task::spawn_blocking(move || sync_file(&src, &dst, resolution)).await;
                    drop(guard);
                    locks.release(&destination);

                    let (status, bytes) = match result {
                        Ok((status, bytes)) => (status, bytes),
                        Err(e) => (SyncStatus::Failed(format!("copy task failed: {}", e)), 0),
                    };
                    (SyncOutcome::new(source, status), bytes)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (outcome, bytes) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        // Reported below once every other task is in
                        warn!("Copy task panicked: {}", e);
                        continue;
                    }
                };
                unfinished.remove(&outcome.path);

                match &outcome.status {
                    SyncStatus::Copied => info!("Synced {}", outcome.path.display()),
                    SyncStatus::Failed(reason) => {
                        warn!("Sync failed for {}: {}", outcome.path.display(), reason)
                    }
                    _ => debug!("{:?}: {}", outcome.status, outcome.path.display()),
                }

                summary.record(&outcome.status);
                summary.bytes_copied += bytes;
                on_outcome(&outcome);
                outcomes.push(outcome);
            }

            let mut lost: Vec<PathBuf> = unfinished.into_iter().collect();
            lost.sort();
            for path in lost {
                let outcome = SyncOutcome::new(
                    path,
                    SyncStatus::Failed("copy task aborted".to_string()),
                );
                summary.record(&outcome.status);
                on_outcome(&outcome);
                outcomes.push(outcome);
            }

            summary.duration_ms = started.elapsed().as_millis() as u64;
            summary.finished_at = Utc::now();

            info!(
                "Batch complete: {} copied, {} unchanged, {} ignored, {} failed",
                summary.copied, summary.unchanged, summary.ignored, summary.failed
            );

            Ok(BatchReport { outcomes, summary })
        }
        .instrument(span)
        .await
    }

    /// Number of destination paths currently locked
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new(4)
    }
}

/// `backup_target / (source - watch_root)`
pub fn destination_for(
    source: &Path,
    watch_root: &Path,
    backup_target: &Path,
) -> std::result::Result<PathBuf, String> {
    let relative = source.strip_prefix(watch_root).map_err(|_| {
        format!(
            "{} is not under watch root {}",
            source.display(),
            watch_root.display()
        )
    })?;
    Ok(backup_target.join(relative))
}

/// Canonicalize the deepest existing ancestor of `path` and re-attach the
/// missing tail, so a target on an unplugged drive still resolves.
pub fn resolve_target(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return tail
                .iter()
                .rev()
                .fold(canonical, |resolved, name| resolved.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Read back a known timestamp to see how finely the filesystem stores it
fn measure_resolution(file: &fs::File) -> Duration {
    let wanted = UNIX_EPOCH + PROBE_MTIME;
    let stored = file
        .set_modified(wanted)
        .and_then(|_| file.metadata())
        .and_then(|meta| meta.modified());

    match stored {
        Ok(stored) => RESOLUTIONS_NS
            .iter()
            .map(|&ns| Duration::from_nanos(ns))
            .find(|&step| floor_to(wanted, step) == stored)
            .map(|step| if step.as_nanos() == 1 { Duration::ZERO } else { step })
            .unwrap_or(Duration::ZERO),
        Err(e) => {
            debug!("Cannot measure timestamp resolution: {}", e);
            Duration::ZERO
        }
    }
}

fn floor_to(time: SystemTime, step: Duration) -> SystemTime {
    let step = step.as_nanos();
    if step <= 1 {
        return time;
    }
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => {
            let floored = since.as_nanos() / step * step;
            UNIX_EPOCH
                + Duration::new(
                    (floored / 1_000_000_000) as u64,
                    (floored % 1_000_000_000) as u32,
                )
        }
        Err(_) => time,
    }
}

fn walk_files(root: &Path, filter: &IgnoreFilter) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        // Prune ignored directories instead of walking into them
        .filter_entry(|entry| entry.depth() == 0 || !filter.should_ignore(entry.path()))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping entry due to error: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| !filter.should_ignore(path))
        .collect()
}

/// Whether `source` must be copied over `destination`. Times are compared
/// at the destination's `resolution`, anything newer than that is a change.
fn needs_copy(
    source: &fs::Metadata,
    destination: Option<&fs::Metadata>,
    resolution: Duration,
) -> bool {
    let Some(destination) = destination else {
        return true;
    };

    if source.len() != destination.len() {
        return true;
    }

    match (source.modified(), destination.modified()) {
        (Ok(src), Ok(dst)) => is_newer(src, dst, resolution),
        // Without timestamps size equality is all we have
        _ => false,
    }
}

fn is_newer(source: SystemTime, destination: SystemTime, resolution: Duration) -> bool {
    floor_to(source, resolution) > floor_to(destination, resolution)
}

/// Copy a single file. Never removes anything from the destination.
fn sync_file(source: &Path, destination: &Path, resolution: Duration) -> (SyncStatus, u64) {
    let src_meta = match fs::metadata(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Source vanished before sync: {}", source.display());
            return (SyncStatus::SkippedIgnored, 0);
        }
        Err(e) => return (SyncStatus::Failed(e.to_string()), 0),
    };

    if !src_meta.is_file() {
        return (SyncStatus::SkippedIgnored, 0);
    }

    let dst_meta = match fs::metadata(destination) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return (SyncStatus::Failed(e.to_string()), 0),
    };

    if let Some(meta) = &dst_meta {
        if meta.is_dir() {
            return (
                SyncStatus::Failed(format!(
                    "destination {} is a directory",
                    destination.display()
                )),
                0,
            );
        }
    }

    if !needs_copy(&src_meta, dst_meta.as_ref(), resolution) {
        return (SyncStatus::SkippedUnchanged, 0);
    }

    match copy_preserving_mtime(source, destination, src_meta.modified().ok()) {
        Ok(bytes) => (SyncStatus::Copied, bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound && !source.exists() => {
            (SyncStatus::SkippedIgnored, 0)
        }
        Err(e) => {
            let error = Error::TransientIo {
                path: source.to_path_buf(),
                source: e,
            };
            (SyncStatus::Failed(error.to_string()), 0)
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.{}", name, PARTIAL_SUFFIX))
}

fn copy_preserving_mtime(
    source: &Path,
    destination: &Path,
    modified: Option<SystemTime>,
) -> io::Result<u64> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }

    let partial = partial_path(destination);
    let result = (|| {
        let bytes = fs::copy(source, &partial)?;
        if let Some(modified) = modified {
            fs::OpenOptions::new()
                .write(true)
                .open(&partial)?
                .set_modified(modified)?;
        }
        fs::rename(&partial, destination)?;
        Ok(bytes)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IgnoreConfig;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        source: PathBuf,
        backup: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let backup = temp.path().join("drive").join("Tether_Backups");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(backup.parent().unwrap()).unwrap();
        Fixture {
            _temp: temp,
            source,
            backup,
        }
    }

    fn job(fx: &Fixture, paths: Vec<PathBuf>, config: IgnoreConfig) -> SyncJob {
        SyncJob {
            watch_root: fx.source.clone(),
            backup_target: fx.backup.clone(),
            paths,
            filter: IgnoreFilter::new(config)
                .with_watch_root(&fx.source)
                .with_backup_target(Some(fx.backup.clone())),
        }
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        fs::OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn status_of(report: &BatchReport, path: &Path) -> SyncStatus {
        report
            .outcomes
            .iter()
            .find(|o| o.path == path)
            .map(|o| o.status.clone())
            .unwrap()
    }

    #[tokio::test]
    async fn test_copies_new_file_with_structure_and_mtime() {
        let fx = fixture();
        let file = fx.source.join("docs").join("notes.txt");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"0123456789").unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&file, mtime);

        let engine = SyncEngine::new(4);
        let report = engine
            .run(job(&fx, vec![file.clone()], IgnoreConfig::empty()), |_| {})
            .await
            .unwrap();

        assert_eq!(status_of(&report, &file), SyncStatus::Copied);
        let copied = fx.backup.join("docs").join("notes.txt");
        assert_eq!(fs::read(&copied).unwrap(), b"0123456789");
        assert_eq!(fs::metadata(&copied).unwrap().modified().unwrap(), mtime);
        assert_eq!(report.summary.copied, 1);
        assert_eq!(report.summary.bytes_copied, 10);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_second_run_is_unchanged() {
        let fx = fixture();
        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(fx.source.join(name), name).unwrap();
        }
        let engine = SyncEngine::default();
        let filter = IgnoreFilter::new(IgnoreConfig::empty()).with_watch_root(&fx.source);
        let files = SyncEngine::plan_tree(&fx.source, &filter);
        assert_eq!(files.len(), 3);

        let first = engine
            .run(job(&fx, files.clone(), IgnoreConfig::empty()), |_| {})
            .await
            .unwrap();
        assert_eq!(first.summary.copied, 3);

        let second = engine
            .run(job(&fx, files, IgnoreConfig::empty()), |_| {})
            .await
            .unwrap();
        assert_eq!(second.summary.unchanged, 3);
        assert!(second
            .outcomes
            .iter()
            .all(|o| o.status == SyncStatus::SkippedUnchanged));
    }

    #[tokio::test]
    async fn test_never_touches_backup_only_files() {
        let fx = fixture();
        fs::create_dir_all(&fx.backup).unwrap();
        let orphan = fx.backup.join("old-report.txt");
        fs::write(&orphan, b"keep me").unwrap();

        // Source deleted before processing
        let gone = fx.source.join("old-report.txt");
        let engine = SyncEngine::default();
        let report = engine
            .run(job(&fx, vec![gone.clone()], IgnoreConfig::empty()), |_| {})
            .await
            .unwrap();

        assert_eq!(status_of(&report, &gone), SyncStatus::SkippedIgnored);
        assert_eq!(fs::read(&orphan).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_changed_size_or_newer_mtime_recopies() {
        let fx = fixture();
        let file = fx.source.join("notes.txt");
        fs::write(&file, b"0123456789").unwrap();
        let engine = SyncEngine::default();
        engine
            .run(job(&fx, vec![file.clone()], IgnoreConfig::empty()), |_| {})
            .await
            .unwrap();

        fs::write(&file, b"0123456789ab").unwrap();
        let report = engine
            .run(job(&fx, vec![file.clone()], IgnoreConfig::empty()), |_| {})
            .await
            .unwrap();
        assert_eq!(status_of(&report, &file), SyncStatus::Copied);
        assert_eq!(fs::read(fx.backup.join("notes.txt")).unwrap().len(), 12);

        // Same size, destination clearly older
        let dest = fx.backup.join("notes.txt");
        fs::write(&file, b"abcdefghijkl").unwrap();
        set_mtime(&dest, SystemTime::now() - Duration::from_secs(600));
        let report = engine
            .run(job(&fx, vec![file.clone()], IgnoreConfig::empty()), |_| {})
            .await
            .unwrap();
        assert_eq!(status_of(&report, &file), SyncStatus::Copied);
        assert_eq!(fs::read(&dest).unwrap(), b"abcdefghijkl");
    }

    #[tokio::test]
    async fn test_same_size_save_shortly_after_sync_is_copied() {
        let fx = fixture();
        let file = fx.source.join("draft.txt");
        fs::write(&file, b"hello").unwrap();
        let engine = SyncEngine::default();

        let first = engine
            .run(job(&fx, vec![file.clone()], IgnoreConfig::empty()), |_| {})
            .await
            .unwrap();
        assert_eq!(status_of(&first, &file), SyncStatus::Copied);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        fs::write(&file, b"world").unwrap();

        let second = engine
            .run(job(&fx, vec![file.clone()], IgnoreConfig::empty()), |_| {})
            .await
            .unwrap();
        assert_eq!(status_of(&second, &file), SyncStatus::Copied);
        assert_eq!(fs::read(fx.backup.join("draft.txt")).unwrap(), b"world");
    }

    #[test]
    fn test_mtime_compared_at_destination_resolution() {
        let base = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let two = Duration::from_secs(2);

        // Exact filesystems: any newer source is a change
        assert!(is_newer(base + Duration::from_millis(1), base, Duration::ZERO));
        assert!(!is_newer(base, base, Duration::ZERO));

        // FAT stored the earlier copy truncated to 2 s
        let stored = floor_to(base + Duration::from_millis(900), two);
        assert!(!is_newer(base + Duration::from_millis(900), stored, two));
        assert!(is_newer(base + Duration::from_millis(2_100), stored, two));
        assert!(!is_newer(base - Duration::from_secs(5), stored, two));
    }

    #[test]
    fn test_validation_leaves_no_marker_files() {
        let fx = fixture();
        SyncEngine::validate_destination(&fx.backup).unwrap();
        SyncEngine::validate_destination(&fx.backup).unwrap();

        let leftovers: Vec<_> = fs::read_dir(&fx.backup)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tether-probe-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_target_follows_symlinked_ancestors() {
        let temp = TempDir::new().unwrap();
        let real = temp.path().join("real");
        fs::create_dir_all(real.join("work")).unwrap();
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let canonical_real = real.canonicalize().unwrap();
        assert_eq!(
            resolve_target(&link.join("work").join("Tether_Backups")),
            canonical_real.join("work").join("Tether_Backups")
        );
        // Missing tail beyond the existing ancestor is kept as is
        assert_eq!(
            resolve_target(&link.join("gone").join("deeper")),
            canonical_real.join("gone").join("deeper")
        );
    }

    #[tokio::test]
    async fn test_outcomes_cover_every_planned_file() {
        let fx = fixture();
        let dir = fx.source.join("album");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..5 {
            fs::write(dir.join(format!("{}.txt", i)), b"x").unwrap();
        }
        let missing = fx.source.join("missing.txt");

        let mut published = 0;
        let report = SyncEngine::new(2)
            .run(
                job(&fx, vec![dir.clone(), missing.clone()], IgnoreConfig::empty()),
                |_| published += 1,
            )
            .await
            .unwrap();

        assert_eq!(published, 6);
        assert_eq!(report.outcomes.len(), 6);
        assert_eq!(report.summary.total(), 6);
        assert_eq!(status_of(&report, &missing), SyncStatus::SkippedIgnored);
    }

    #[tokio::test]
    async fn test_directories_expand_and_filter() {
        let fx = fixture();
        let dir = fx.source.join("project");
        fs::create_dir_all(dir.join("node_modules").join("pkg")).unwrap();
        fs::write(dir.join("node_modules").join("pkg").join("index.js"), b"x").unwrap();
        fs::write(dir.join("main.rs"), b"fn main() {}").unwrap();
        fs::write(dir.join("cover.psd"), b"layers").unwrap();

        let engine = SyncEngine::default();
        let report = engine
            .run(
                job(&fx, vec![dir.clone()], IgnoreConfig::with_extensions(["psd"])),
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(report.summary.copied, 1);
        assert!(fx.backup.join("project").join("main.rs").exists());
        assert!(!fx.backup.join("project").join("cover.psd").exists());
        assert!(!fx.backup.join("project").join("node_modules").exists());
    }

    #[tokio::test]
    async fn test_ignored_paths_never_reach_copy() {
        let fx = fixture();
        let log = fx.source.join("debug.log");
        let marker = fx.source.join(".DS_Store");
        fs::write(&log, b"noise").unwrap();
        fs::write(&marker, b"noise").unwrap();

        let report = SyncEngine::default()
            .run(
                job(&fx, vec![log.clone(), marker.clone()], IgnoreConfig::empty()),
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(status_of(&report, &log), SyncStatus::SkippedIgnored);
        assert_eq!(status_of(&report, &marker), SyncStatus::SkippedIgnored);
        assert_eq!(report.summary.ignored, 2);
        assert!(!fx.backup.join("debug.log").exists());
    }

    #[tokio::test]
    async fn test_unmounted_destination_fails_whole_batch() {
        let fx = fixture();
        let file = fx.source.join("a.txt");
        fs::write(&file, b"a").unwrap();

        let mut job = job(&fx, vec![file], IgnoreConfig::empty());
        job.backup_target = fx.source.parent().unwrap().join("unplugged").join("Tether_Backups");

        let result = SyncEngine::default().run(job.clone(), |_| {}).await;
        assert!(matches!(result, Err(Error::DestinationUnavailable { .. })));
        assert!(!job.backup_target.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_concurrent_files_all_reach_terminal_outcome() {
        let fx = fixture();
        let files: Vec<PathBuf> = (0..16)
            .map(|i| {
                let path = fx.source.join(format!("file-{}.txt", i));
                fs::write(&path, vec![b'x'; 1024 * (i + 1)]).unwrap();
                path
            })
            .collect();

        let mut seen = Vec::new();
        let report = SyncEngine::new(3)
            .run(job(&fx, files.clone(), IgnoreConfig::empty()), |outcome| {
                seen.push(outcome.path.clone())
            })
            .await
            .unwrap();

        assert_eq!(seen.len(), files.len());
        assert_eq!(report.summary.total(), files.len());
        assert_eq!(report.summary.copied, files.len());
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let fx = fixture();
        fs::create_dir_all(&fx.backup).unwrap();
        let good = fx.source.join("good.txt");
        let blocked = fx.source.join("blocked.txt");
        fs::write(&good, b"good").unwrap();
        fs::write(&blocked, b"blocked").unwrap();
        // A directory where the file should go makes that one copy fail
        fs::create_dir_all(fx.backup.join("blocked.txt")).unwrap();

        let report = SyncEngine::default()
            .run(
                job(&fx, vec![blocked.clone(), good.clone()], IgnoreConfig::empty()),
                |_| {},
            )
            .await
            .unwrap();

        assert!(matches!(status_of(&report, &blocked), SyncStatus::Failed(_)));
        assert_eq!(status_of(&report, &good), SyncStatus::Copied);
    }

    #[test]
    fn test_destination_mapping() {
        assert_eq!(
            destination_for(
                Path::new("/w/a/b.txt"),
                Path::new("/w"),
                Path::new("/media/usb/Tether_Backups")
            ),
            Ok(PathBuf::from("/media/usb/Tether_Backups/a/b.txt"))
        );
        assert!(destination_for(Path::new("/elsewhere/b.txt"), Path::new("/w"), Path::new("/b")).is_err());
    }

    #[test]
    fn test_partial_files_are_hidden() {
        let partial = partial_path(Path::new("/b/notes.txt"));
        assert_eq!(partial, PathBuf::from("/b/.notes.txt.tether-partial"));
        assert!(IgnoreFilter::new(IgnoreConfig::empty())
            .with_watch_root("/b")
            .should_ignore(&partial));
    }
}

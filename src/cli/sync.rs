//! Sync command implementation.

use crate::cli::absolute;
use crate::config::{ConfigStore, TomlConfigStore};
use crate::filter::IgnoreFilter;
use crate::sync::{resolve_target, SyncEngine, SyncJob, SyncStatus};
use anyhow::Context;
use clap::Args;
use std::path::PathBuf;

/// Arguments for the sync command
#[derive(Args)]
pub struct SyncArgs {
    /// Directory to mirror
    #[arg(short, long)]
    pub source: PathBuf,

    /// Drive or directory receiving the backup folder
    #[arg(short, long)]
    pub dest: PathBuf,

    /// Only report what would be copied
    #[arg(long)]
    pub dry_run: bool,
}

/// Run the sync command
pub async fn run(args: SyncArgs) -> anyhow::Result<()> {
    let config = TomlConfigStore::default_location()?.load()?;

    let source = args
        .source
        .canonicalize()
        .with_context(|| format!("Cannot read {}", args.source.display()))?;
    let dest = absolute(&args.dest).context("Cannot resolve destination")?;
    let target = resolve_target(&config.backup.backup_target_for(&dest));

    let filter = IgnoreFilter::new(config.ignore.clone())
        .with_watch_root(&source)
        .with_backup_target(Some(target.clone()));
    let files = SyncEngine::plan_tree(&source, &filter);

    println!(
        "Mirroring {} -> {} ({} files)",
        source.display(),
        target.display(),
        files.len()
    );

    if args.dry_run {
        for file in &files {
            println!("  {}", file.display());
        }
        return Ok(());
    }

    let engine = SyncEngine::new(config.backup.max_parallel_copies);
    let job = SyncJob {
        watch_root: source,
        backup_target: target,
        paths: files,
        filter,
    };

    let report = engine
        .run(job, |outcome| {
            if let SyncStatus::Failed(reason) = &outcome.status {
                eprintln!("failed {}: {}", outcome.path.display(), reason);
            }
        })
        .await?;

    let summary = report.summary;
    println!("Sync completed!");
    println!("  Copied: {}", summary.copied);
    println!("  Unchanged: {}", summary.unchanged);
    println!("  Ignored: {}", summary.ignored);
    println!("  Failed: {}", summary.failed);
    println!("  Bytes copied: {}", summary.bytes_copied);

    if summary.failed > 0 {
        anyhow::bail!("{} files could not be copied", summary.failed);
    }
    Ok(())
}

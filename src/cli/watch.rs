//! Watch command implementation.

use crate::cli::absolute;
use crate::config::TomlConfigStore;
use crate::drives::SysinfoDrives;
use crate::events::Notification;
use crate::logging::{init_file_logging, init_logging};
use crate::session::SessionController;
use crate::sync::SyncStatus;
use anyhow::{bail, Context};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Arguments for the watch command
#[derive(Args)]
pub struct WatchArgs {
    /// Directory to watch
    #[arg(short, long)]
    pub source: PathBuf,

    /// Drive or directory receiving the backup folder
    #[arg(short, long)]
    pub dest: PathBuf,

    /// Print notifications as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Run the watch command
pub async fn run(args: WatchArgs) -> anyhow::Result<()> {
    match &args.log_file {
        Some(path) => init_file_logging(path, args.verbose)?,
        None => init_logging(args.verbose)?,
    }

    let store = TomlConfigStore::default_location()?;
    let session = SessionController::new(Arc::new(store), Arc::new(SysinfoDrives))?;

    let dest = absolute(&args.dest).context("Cannot resolve destination")?;
    let target = session.set_backup_path(&dest).await?;

    let mut notifications = session.subscribe();
    session.start_drive_monitor();
    session
        .start(&args.source)
        .await
        .with_context(|| format!("Cannot watch {}", args.source.display()))?;

    println!(
        "Watching {} -> {} (Ctrl-C to stop)",
        args.source.display(),
        target.display()
    );

    let mut failure = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = notifications.recv() => match received {
                Some(notification) => {
                    render(&notification, args.json);
                    if let Notification::WatcherFailed { reason } = notification {
                        failure = Some(reason);
                        break;
                    }
                }
                None => break,
            }
        }
    }

    session.shutdown().await?;

    if let Some(reason) = failure {
        bail!("Watching stopped: {}", reason);
    }
    println!("Stopped.");
    Ok(())
}

fn render(notification: &Notification, json: bool) {
    if json {
        match serde_json::to_string(notification) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Cannot serialize notification: {}", e),
        }
        return;
    }

    match notification {
        Notification::DrivesChanged { drives } => {
            println!("drives: {} eligible", drives.len());
            for drive in drives {
                println!("  {} ({})", drive.mount_point.display(), drive.name);
            }
        }
        Notification::FileChanged { paths } => {
            println!("changed: {} paths", paths.len());
        }
        Notification::BatchStarted { paths } => {
            println!("syncing: {} paths", paths.len());
        }
        Notification::SyncOutcome(outcome) => match &outcome.status {
            SyncStatus::Copied => println!("copied    {}", outcome.path.display()),
            SyncStatus::Failed(reason) => {
                println!("failed    {} ({})", outcome.path.display(), reason)
            }
            // Skips are only interesting in the logs
            SyncStatus::SkippedUnchanged | SyncStatus::SkippedIgnored => {}
        },
        Notification::FileSynced { .. } => {}
        Notification::BatchProcessed(summary) => {
            println!(
                "batch: {} copied, {} unchanged, {} ignored, {} failed ({} bytes, {} ms)",
                summary.copied,
                summary.unchanged,
                summary.ignored,
                summary.failed,
                summary.bytes_copied,
                summary.duration_ms
            );
        }
        Notification::DestinationUnavailable {
            backup_target,
            reason,
            deferred,
        } => {
            println!(
                "destination {} unavailable ({}); {} paths waiting",
                backup_target.display(),
                reason,
                deferred
            );
        }
        Notification::WatcherFailed { reason } => println!("watcher failed: {}", reason),
        Notification::PhaseChanged { phase } => println!("session: {:?}", phase),
    }
}

//! Drives command implementation.

use crate::config::DriveConfig;
use crate::drives::{DriveInfo, DriveMonitor, SysinfoDrives};
use clap::Args;
use std::sync::Arc;

/// Arguments for the drives command
#[derive(Args)]
pub struct DrivesArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Include network mounts
    #[arg(long)]
    pub network: bool,
}

/// Run the drives command
pub async fn run(args: DrivesArgs) -> anyhow::Result<()> {
    let config = DriveConfig {
        include_network: args.network,
        ..DriveConfig::default()
    };
    let monitor = DriveMonitor::new(Arc::new(SysinfoDrives), config);
    let drives = tokio::task::spawn_blocking(move || monitor.snapshot()).await??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&drives)?);
        return Ok(());
    }

    println!("Backup Drives");
    println!("=============\n");

    if drives.is_empty() {
        println!("No eligible drives mounted.");
        return Ok(());
    }

    for drive in &drives {
        print_drive(drive);
    }

    Ok(())
}

fn print_drive(drive: &DriveInfo) {
    println!("{}", drive.mount_point.display());
    println!("  Name: {}", if drive.name.is_empty() { "-" } else { &drive.name });
    println!("  File system: {}", drive.file_system);
    println!(
        "  Free: {} of {}",
        format_size(drive.available_space),
        format_size(drive.total_space)
    );
    if drive.is_removable {
        println!("  Removable");
    }
    println!();
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(64 * 1024 * 1024 * 1024), "64.0 GB");
    }
}

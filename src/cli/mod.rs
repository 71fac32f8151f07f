//! Command-line interface for Tether.
//!
//! A thin presentation layer: every command drives the library and renders
//! what it reports.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

pub mod config;
pub mod drives;
pub mod sync;
pub mod watch;

/// Tether - live backup of a working directory onto external storage
#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Mirror a working directory onto a backup drive as files are saved")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Watch a directory and back up changes until interrupted
    Watch(watch::WatchArgs),
    /// List drives that can receive backups
    Drives(drives::DrivesArgs),
    /// Mirror a whole directory once
    Sync(sync::SyncArgs),
    /// Inspect or change the ignore configuration
    Config(config::ConfigArgs),
}

/// Resolve `path` against the current directory
pub(crate) fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_watch() {
        let cli = Cli::try_parse_from([
            "tether", "watch", "--source", "/home/me/work", "--dest", "/media/usb", "--verbose",
        ])
        .unwrap();
        match cli.command {
            Commands::Watch(args) => {
                assert_eq!(args.source, PathBuf::from("/home/me/work"));
                assert_eq!(args.dest, PathBuf::from("/media/usb"));
                assert!(args.verbose);
                assert!(args.log_file.is_none());
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn test_parse_config_add_ext() {
        let cli = Cli::try_parse_from(["tether", "config", "add-ext", "psd"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(config::ConfigArgs {
                command: config::ConfigCommand::AddExt { ref extension },
            }) if extension == "psd"
        ));
    }

    #[test]
    fn test_absolute_keeps_absolute_paths() {
        assert_eq!(
            absolute(Path::new("/media/usb")).unwrap(),
            PathBuf::from("/media/usb")
        );
        assert!(absolute(Path::new("relative")).unwrap().is_absolute());
    }
}

//! Config command implementation.

use crate::config::{ConfigStore, TomlConfigStore};
use crate::drives::SysinfoDrives;
use crate::session::SessionController;
use clap::{Args, Subcommand};
use std::sync::Arc;

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the configuration file
    Show,
    /// Ignore files with this extension
    AddExt { extension: String },
    /// Stop ignoring files with this extension
    RemoveExt { extension: String },
}

/// Run the config command
pub async fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let store = TomlConfigStore::default_location()?;

    match args.command {
        ConfigCommand::Show => {
            let config = store.load()?;
            println!("# {}", store.path().display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommand::AddExt { extension } => {
            let session = SessionController::new(Arc::new(store), Arc::new(SysinfoDrives))?;
            if session.add_ignored_extension(&extension).await? {
                println!("Now ignoring .{}", extension.trim_start_matches('.'));
            } else {
                println!(".{} is already ignored", extension.trim_start_matches('.'));
            }
        }
        ConfigCommand::RemoveExt { extension } => {
            let session = SessionController::new(Arc::new(store), Arc::new(SysinfoDrives))?;
            if session.remove_ignored_extension(&extension).await? {
                println!("No longer ignoring .{}", extension.trim_start_matches('.'));
            } else {
                println!(".{} was not ignored", extension.trim_start_matches('.'));
            }
        }
    }

    Ok(())
}

//! # Tether
//!
//! Live backup of a working directory onto removable or external storage.
//!
//! ## Features
//!
//! - **Change Watcher**: recursive filesystem observation with debounced batches
//! - **Ignore Filter**: extension, noise and backup-output exclusion
//! - **Sync Engine**: bounded-parallel, mtime-preserving copies that never delete
//! - **Drive Monitor**: detection of mounted volumes eligible as destinations
//! - **Session Controller**: lifecycle and notifications tying the pieces together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether::config::TomlConfigStore;
//! use tether::drives::SysinfoDrives;
//! use tether::SessionController;
//!
//! # #[tokio::main]
//! # async fn main() -> tether::Result<()> {
//! let store = Arc::new(TomlConfigStore::default_location()?);
//! let session = SessionController::new(store, Arc::new(SysinfoDrives))?;
//!
//! session.set_backup_path("/media/usb").await?;
//! session.start("/home/me/Documents").await?;
//!
//! let mut notifications = session.subscribe();
//! while let Some(notification) = notifications.recv().await {
//!     println!("{:?}", notification);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod drives;
pub mod error;
pub mod events;
pub mod filter;
pub mod logging;
pub mod session;
pub mod sync;
pub mod watcher;

// Re-export commonly used types
pub use config::{IgnoreConfig, SyncConfig};
pub use drives::DriveInfo;
pub use error::{Error, Result};
pub use events::{Notification, NotificationBus};
pub use filter::IgnoreFilter;
pub use session::{Phase, SessionController, SessionState};
pub use sync::{SyncEngine, SyncOutcome, SyncStatus};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

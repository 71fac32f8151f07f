//! Noise and exclusion filtering for changed paths.
//!
//! [`IgnoreFilter`] is an immutable snapshot: the session controller builds
//! one per batch from the current [`IgnoreConfig`] and targets, so it can be
//! shared across copy tasks without synchronization.

use crate::config::IgnoreConfig;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Path components that are never worth backing up
pub const NOISE_COMPONENTS: &[&str] = &[
    "node_modules",
    "target",
    "__pycache__",
    "Library",
    "AppData",
    "Thumbs.db",
    "desktop.ini",
    "$RECYCLE.BIN",
    "System Volume Information",
];

/// Extensions of metadata, log and partial-download files
pub const NOISE_EXTENSIONS: &[&str] = &[
    "plist",
    "log",
    "tmp",
    "temp",
    "crdownload",
    "part",
    "lock",
    "shm",
    "wal",
    "swp",
    "ds_store",
];

/// Why a path was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Hard-coded system artifact or cache
    Noise,
    /// Extension listed in the user's configuration
    Extension,
    /// The path is inside the backup target
    BackupOutput,
}

#[derive(Debug, Clone)]
pub struct IgnoreFilter {
    config: IgnoreConfig,
    watch_root: Option<PathBuf>,
    backup_target: Option<PathBuf>,
}

impl IgnoreFilter {
    pub fn new(config: IgnoreConfig) -> Self {
        Self {
            config,
            watch_root: None,
            backup_target: None,
        }
    }

    /// Only components below this root are checked for noise, so a watch
    /// root that itself lives under a hidden directory still works.
    pub fn with_watch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.watch_root = Some(root.into());
        self
    }

    pub fn with_backup_target(mut self, target: Option<PathBuf>) -> Self {
        self.backup_target = target;
        self
    }

    pub fn config(&self) -> &IgnoreConfig {
        &self.config
    }

    pub fn should_ignore(&self, path: &Path) -> bool {
        self.ignore_reason(path).is_some()
    }

    /// Rules are applied in order; the first match wins
    pub fn ignore_reason(&self, path: &Path) -> Option<IgnoreReason> {
        let relevant = self
            .watch_root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path);

        if relevant.components().any(is_noise_component) || has_noise_extension(path) {
            return Some(IgnoreReason::Noise);
        }

        if let Some(ext) = path.extension().and_then(OsStr::to_str) {
            if self.config.contains(ext) {
                return Some(IgnoreReason::Extension);
            }
        }

        if let Some(target) = &self.backup_target {
            if path.starts_with(target) {
                return Some(IgnoreReason::BackupOutput);
            }
        }

        None
    }
}

/// Stateless form of the filter for callers without target context.
///
/// With no watch root every component of `path` is checked, so anything
/// below a hidden directory such as `~/.work` counts as noise. Use
/// [`should_ignore_under`] when the root is known.
pub fn should_ignore(path: &Path, config: &IgnoreConfig) -> bool {
    IgnoreFilter::new(config.clone()).should_ignore(path)
}

/// Like [`should_ignore`], checking only components below `watch_root`
pub fn should_ignore_under(path: &Path, watch_root: &Path, config: &IgnoreConfig) -> bool {
    IgnoreFilter::new(config.clone())
        .with_watch_root(watch_root)
        .should_ignore(path)
}

fn is_noise_component(component: Component<'_>) -> bool {
    let Component::Normal(name) = component else {
        return false;
    };
    let name = name.to_string_lossy();
    // Hidden entries: .git, .DS_Store, .Trash, .fseventsd and friends
    name.starts_with('.') || NOISE_COMPONENTS.contains(&name.as_ref())
}

fn has_noise_extension(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| {
            let ext = ext.to_lowercase();
            NOISE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> IgnoreFilter {
        IgnoreFilter::new(IgnoreConfig::with_extensions(["psd", "log"]))
            .with_watch_root("/home/user/.work/project")
    }

    #[test]
    fn test_system_noise_is_ignored() {
        let filter = filter();
        let root = Path::new("/home/user/.work/project");

        assert_eq!(
            filter.ignore_reason(&root.join(".DS_Store")),
            Some(IgnoreReason::Noise)
        );
        assert_eq!(
            filter.ignore_reason(&root.join("docs/thing.DS_Store")),
            Some(IgnoreReason::Noise)
        );
        assert!(filter.should_ignore(&root.join("web/node_modules/react/index.js")));
        assert!(filter.should_ignore(&root.join(".git/HEAD")));
        assert!(filter.should_ignore(&root.join("Info.plist")));
        assert!(filter.should_ignore(&root.join("download.CRDOWNLOAD")));
        assert!(filter.should_ignore(&root.join("pics/Thumbs.db")));
    }

    #[test]
    fn test_hidden_watch_root_is_not_noise() {
        let filter = filter();
        let root = Path::new("/home/user/.work/project");
        assert!(!filter.should_ignore(&root.join("notes.txt")));
        assert!(!filter.should_ignore(&root.join("src/main.rs")));
    }

    #[test]
    fn test_free_functions_and_hidden_ancestors() {
        let config = IgnoreConfig::with_extensions(["psd"]);
        let inside_hidden = Path::new("/home/user/.work/x.txt");

        assert!(should_ignore(inside_hidden, &config));
        assert!(!should_ignore_under(
            inside_hidden,
            Path::new("/home/user/.work"),
            &config
        ));
        assert!(should_ignore_under(
            Path::new("/home/user/.work/cover.psd"),
            Path::new("/home/user/.work"),
            &config
        ));
        assert!(should_ignore_under(
            Path::new("/home/user/.work/.cache/x.txt"),
            Path::new("/home/user/.work"),
            &config
        ));
    }

    #[test]
    fn test_configured_extensions_are_case_insensitive() {
        let filter = IgnoreFilter::new(IgnoreConfig::with_extensions(["psd"]));
        assert_eq!(
            filter.ignore_reason(Path::new("/w/art/cover.PSD")),
            Some(IgnoreReason::Extension)
        );
        assert!(!filter.should_ignore(Path::new("/w/art/cover.png")));
        assert!(!filter.should_ignore(Path::new("/w/art/psd")));
    }

    #[test]
    fn test_backup_output_inside_watch_root() {
        let filter = IgnoreFilter::new(IgnoreConfig::empty())
            .with_watch_root("/w")
            .with_backup_target(Some(PathBuf::from("/w/Tether_Backups")));

        assert_eq!(
            filter.ignore_reason(Path::new("/w/Tether_Backups/notes.txt")),
            Some(IgnoreReason::BackupOutput)
        );
        assert!(filter.should_ignore(Path::new("/w/Tether_Backups")));
        assert!(!filter.should_ignore(Path::new("/w/Tether_Backups_old/notes.txt")));
    }

    #[test]
    fn test_free_function_uses_config() {
        let config = IgnoreConfig::with_extensions(["bak"]);
        assert!(should_ignore(Path::new("/w/a.bak"), &config));
        assert!(!should_ignore(Path::new("/w/a.txt"), &config));
    }
}

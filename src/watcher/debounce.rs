//! Time-window coalescing of raw change events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    /// A rename where the backend could not tell which side this path is
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Deduplicated changes collected over one debounce window, in the order
/// each path was first seen. The kind is the last one observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    entries: Vec<(PathBuf, ChangeKind)>,
    index: HashMap<PathBuf, usize>,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: PathBuf, kind: ChangeKind) {
        match self.index.get(&path) {
            Some(&slot) => self.entries[slot].1 = kind,
            None => {
                self.index.insert(path.clone(), self.entries.len());
                self.entries.push((path, kind));
            }
        }
    }

    /// Append another batch, keeping this batch's order first
    pub fn merge(&mut self, other: ChangeBatch) {
        for (path, kind) in other.entries {
            self.insert(path, kind);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kind_of(&self, path: &std::path::Path) -> Option<ChangeKind> {
        self.index.get(path).map(|&slot| self.entries[slot].1)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|(path, _)| path.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, ChangeKind)> {
        self.entries.iter().map(|(path, kind)| (path, *kind))
    }
}

impl FromIterator<ChangeEvent> for ChangeBatch {
    fn from_iter<I: IntoIterator<Item = ChangeEvent>>(iter: I) -> Self {
        let mut batch = ChangeBatch::new();
        for event in iter {
            batch.insert(event.path, event.kind);
        }
        batch
    }
}

/// Accumulates events until the window goes quiet or the hold ceiling is hit
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    max_hold: Duration,
    pending: ChangeBatch,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration, max_hold: Duration) -> Self {
        Self {
            window,
            max_hold: max_hold.max(window),
            pending: ChangeBatch::new(),
            first_at: None,
            last_at: None,
        }
    }

    pub fn push(&mut self, event: ChangeEvent, now: Instant) {
        self.first_at.get_or_insert(now);
        self.last_at = Some(now);
        self.pending.insert(event.path, event.kind);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// When the pending batch must be flushed, if anything is pending
    pub fn deadline(&self) -> Option<Instant> {
        match (self.first_at, self.last_at) {
            (Some(first), Some(last)) => Some((last + self.window).min(first + self.max_hold)),
            _ => None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().map(|deadline| now >= deadline).unwrap_or(false)
    }

    /// Take the pending batch, resetting the window
    pub fn flush(&mut self) -> Option<ChangeBatch> {
        self.first_at = None;
        self.last_at = None;
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WINDOW: Duration = Duration::from_millis(500);
    const HOLD: Duration = Duration::from_millis(2_000);

    #[test]
    fn test_rapid_modifications_coalesce() {
        let mut debouncer = Debouncer::new(WINDOW, HOLD);
        let start = Instant::now();

        for i in 0..50 {
            debouncer.push(
                ChangeEvent::new("/w/notes.txt", ChangeKind::Modified),
                start + Duration::from_millis(i),
            );
        }

        assert!(!debouncer.is_due(start + Duration::from_millis(100)));
        assert!(debouncer.is_due(start + Duration::from_millis(49) + WINDOW));

        let batch = debouncer.flush().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.paths(), vec![PathBuf::from("/w/notes.txt")]);
        assert!(debouncer.flush().is_none());
        assert!(debouncer.deadline().is_none());
    }

    #[test]
    fn test_window_slides_until_max_hold() {
        let mut debouncer = Debouncer::new(WINDOW, HOLD);
        let start = Instant::now();

        // An event every 400ms keeps the quiet window from elapsing
        for i in 0..10u64 {
            debouncer.push(
                ChangeEvent::new(format!("/w/{}.txt", i), ChangeKind::Created),
                start + Duration::from_millis(400 * i),
            );
        }

        assert_eq!(debouncer.deadline(), Some(start + HOLD));
        assert!(debouncer.is_due(start + HOLD));
    }

    #[test]
    fn test_last_kind_wins_and_order_is_kept() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW, HOLD);
        debouncer.push(ChangeEvent::new("/w/b.txt", ChangeKind::Created), now);
        debouncer.push(ChangeEvent::new("/w/a.txt", ChangeKind::Created), now);
        debouncer.push(ChangeEvent::new("/w/b.txt", ChangeKind::Removed), now);

        let batch = debouncer.flush().unwrap();
        assert_eq!(
            batch.paths(),
            vec![PathBuf::from("/w/b.txt"), PathBuf::from("/w/a.txt")]
        );
        assert_eq!(
            batch.kind_of(std::path::Path::new("/w/b.txt")),
            Some(ChangeKind::Removed)
        );
    }

    #[test]
    fn test_merge_keeps_existing_order() {
        let mut first: ChangeBatch = vec![
            ChangeEvent::new("/w/a", ChangeKind::Modified),
            ChangeEvent::new("/w/b", ChangeKind::Modified),
        ]
        .into_iter()
        .collect();
        let second: ChangeBatch = vec![
            ChangeEvent::new("/w/c", ChangeKind::Created),
            ChangeEvent::new("/w/a", ChangeKind::Removed),
        ]
        .into_iter()
        .collect();

        first.merge(second);
        assert_eq!(
            first.paths(),
            vec![
                PathBuf::from("/w/a"),
                PathBuf::from("/w/b"),
                PathBuf::from("/w/c")
            ]
        );
        assert_eq!(
            first.kind_of(std::path::Path::new("/w/a")),
            Some(ChangeKind::Removed)
        );
    }
}

//! Per-path settle windows.
//!
//! Every touch pushes the path's deadline to `now + window`; a path becomes
//! due once nothing touched it for a whole window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    deadlines: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadlines: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.deadlines.contains_key(path)
    }

    /// Record a change at `now`, restarting the path's window.
    pub fn touch(&mut self, path: impl Into<PathBuf>, now: Instant) {
        self.deadlines.insert(path.into(), now + self.window);
    }

    /// Drop a pending path. Returns whether it was pending.
    pub fn forget(&mut self, path: &Path) -> bool {
        self.deadlines.remove(path).is_some()
    }

    /// Drop every pending path at or below `prefix`.
    pub fn forget_below(&mut self, prefix: &Path) {
        self.deadlines.retain(|path, _| !path.starts_with(prefix));
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return the paths whose window elapsed by `now`, oldest
    /// deadline first.
    pub fn drain_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<(Instant, PathBuf)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, deadline)| (*deadline, path.clone()))
            .collect();
        due.sort();
        for (_, path) in &due {
            self.deadlines.remove(path);
        }
        due.into_iter().map(|(_, path)| path).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(400);

    #[test]
    fn due_after_a_quiet_window() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.touch("/m/a.rs", start);

        assert!(debouncer.drain_due(start + Duration::from_millis(399)).is_empty());
        assert_eq!(debouncer.drain_due(start + WINDOW), vec![PathBuf::from("/m/a.rs")]);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn touch_restarts_the_window() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.touch("/m/a.rs", start);
        debouncer.touch("/m/a.rs", start + Duration::from_millis(300));

        assert!(debouncer.drain_due(start + Duration::from_millis(500)).is_empty());
        assert_eq!(debouncer.next_deadline(), Some(start + Duration::from_millis(700)));
        assert_eq!(debouncer.drain_due(start + Duration::from_millis(700)).len(), 1);
    }

    #[test]
    fn drains_in_deadline_order() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.touch("/m/b.rs", start + Duration::from_millis(50));
        debouncer.touch("/m/a.rs", start);
        debouncer.touch("/m/c.rs", start + Duration::from_secs(5));

        assert_eq!(debouncer.next_deadline(), Some(start + WINDOW));
        assert_eq!(
            debouncer.drain_due(start + Duration::from_secs(1)),
            vec![PathBuf::from("/m/a.rs"), PathBuf::from("/m/b.rs")]
        );
        assert!(debouncer.is_pending(Path::new("/m/c.rs")));
    }

    #[test]
    fn forget_cancels_pending_paths() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.touch("/m/a.rs", start);
        debouncer.touch("/m/dir/b.rs", start);
        debouncer.touch("/m/dir/c.rs", start);

        assert!(debouncer.forget(Path::new("/m/a.rs")));
        assert!(!debouncer.forget(Path::new("/m/a.rs")));
        debouncer.forget_below(Path::new("/m/dir"));

        assert!(debouncer.is_empty());
        assert_eq!(debouncer.next_deadline(), None);
    }
}

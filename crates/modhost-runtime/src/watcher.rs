//! File system watcher for the module tree
//!
//! Watches a root directory recursively and reports created, changed and
//! removed entries. [`ModuleWatcher::scan`] enumerates what already exists
//! so the host can register the tree before any event arrives.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind, RenameMode},
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Watch event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Changed,
    Removed,
}

/// A change below the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
    /// Always `false` for removals; the entry is gone by then.
    pub is_directory: bool,
}

impl FsEvent {
    pub fn created(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self {
            kind: FsEventKind::Created,
            path: path.into(),
            is_directory,
        }
    }

    pub fn changed(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Changed,
            path: path.into(),
            is_directory: false,
        }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Removed,
            path: path.into(),
            is_directory: false,
        }
    }
}

/// Watch configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// File extensions treated as modules; empty accepts every file
    pub extensions: Vec<String>,
    /// Ignore patterns (`*suffix`, `prefix*` or exact names)
    pub ignore_patterns: Vec<String>,
    /// Poll interval for platforms without native notifications
    pub poll_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            ignore_patterns: default_ignore_patterns(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

pub(crate) fn default_ignore_patterns() -> Vec<String> {
    vec![
        "*.tmp".to_string(),
        "*.swp".to_string(),
        "*~".to_string(),
        ".*".to_string(),
    ]
}

impl WatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extensions.push(ext.trim_start_matches('.').to_string());
        self
    }

    pub fn with_ignore(mut self, pattern: &str) -> Self {
        self.ignore_patterns.push(pattern.to_string());
        self
    }

    /// Whether an entry name matches one of the ignore patterns.
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignore_patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                name.starts_with(prefix)
            } else {
                name == pattern
            }
        })
    }

    /// Check if a file should be treated as a module
    pub fn should_watch(&self, path: &Path) -> bool {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if self.is_ignored(name) {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        self.extensions.iter().any(|e| e == ext)
    }

    /// Filter for events below `root`: any ignored component hides the
    /// event, and file events must pass [`Self::should_watch`].
    fn accepts(&self, root: &Path, event: &FsEvent) -> bool {
        let relative = event.path.strip_prefix(root).unwrap_or(&event.path);
        let hidden = relative.components().any(|component| match component {
            Component::Normal(name) => name.to_str().is_some_and(|name| self.is_ignored(name)),
            _ => false,
        });
        if hidden {
            return false;
        }
        match event.kind {
            FsEventKind::Removed => true,
            _ if event.is_directory => true,
            _ => self.should_watch(&event.path),
        }
    }
}

/// Recursive watcher over one module root.
pub struct ModuleWatcher {
    root: PathBuf,
    config: WatchConfig,
    event_tx: mpsc::Sender<FsEvent>,
    /// Event receiver (taken by consumer)
    event_rx: Option<mpsc::Receiver<FsEvent>>,
    watcher: Option<RecommendedWatcher>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl std::fmt::Debug for ModuleWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleWatcher")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("running", &self.watcher.is_some())
            .finish()
    }
}

impl ModuleWatcher {
    pub fn new(root: impl Into<PathBuf>, config: WatchConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);

        Self {
            root: root.into(),
            config,
            event_tx,
            event_rx: Some(event_rx),
            watcher: None,
            shutdown_tx: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<FsEvent>> {
        self.event_rx.take()
    }

    /// Start watching for changes
    pub fn start(&mut self) -> Result<(), notify::Error> {
        if self.watcher.is_some() {
            return Ok(());
        }
        info!("Starting module watcher on {:?}", self.root);

        let event_tx = self.event_tx.clone();
        let config = self.config.clone();
        let root = self.root.clone();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (tx, mut rx) = mpsc::channel(1024);

        let watcher_config = Config::default().with_poll_interval(self.config.poll_interval);
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            },
            watcher_config,
        )?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;

        self.watcher = Some(watcher);
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        for fs_event in convert(event) {
                            if !config.accepts(&root, &fs_event) {
                                continue;
                            }
                            debug!(kind = ?fs_event.kind, path = ?fs_event.path, "Watch event");
                            if event_tx.send(fs_event).await.is_err() {
                                error!("Failed to send watch event");
                                return;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Module watcher shutting down");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop watching
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self.watcher = None;
    }

    /// Enumerate the existing tree below the root.
    pub fn scan(&self) -> Vec<FsEvent> {
        self.scan_path(&self.root)
    }

    /// Enumerate `path` and everything below it, parents before children,
    /// siblings in name order. Ignored directories are not descended into.
    pub fn scan_path(&self, path: &Path) -> Vec<FsEvent> {
        let mut found = Vec::new();
        let walker = WalkDir::new(path)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_none_or(|name| !self.config.is_ignored(name))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry during scan");
                    continue;
                }
            };
            let is_directory = entry.file_type().is_dir();
            if is_directory || self.config.should_watch(entry.path()) {
                found.push(FsEvent::created(entry.into_path(), is_directory));
            }
        }
        found
    }
}

/// Translate one notify event into zero or more module events.
fn convert(event: Event) -> Vec<FsEvent> {
    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Create(kind) => paths
            .into_iter()
            .map(|path| {
                let is_directory = kind == CreateKind::Folder || path.is_dir();
                FsEvent::created(path, is_directory)
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(FsEvent::removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
            .into_iter()
            .map(|path| {
                let is_directory = path.is_dir();
                FsEvent::created(path, is_directory)
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = paths.into_iter();
            let mut events = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                events.push(FsEvent::removed(from));
            }
            if let Some(to) = paths.next() {
                let is_directory = to.is_dir();
                events.push(FsEvent::created(to, is_directory));
            }
            events
        }
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .into_iter()
            .map(|path| {
                if path.exists() {
                    let is_directory = path.is_dir();
                    FsEvent::created(path, is_directory)
                } else {
                    FsEvent::removed(path)
                }
            })
            .collect(),
        EventKind::Modify(_) => paths
            .into_iter()
            .filter(|path| !path.is_dir())
            .map(FsEvent::changed)
            .collect(),
        EventKind::Remove(_) => {
            paths.into_iter().map(FsEvent::removed).collect()
        }
        _ => Vec::new(),
    }
}

//! Change Watcher
//!
//! Recursive filesystem watcher that turns raw OS notifications into
//! debounced logical sync events. Hidden files and editor temp files are
//! filtered out, renames collapse to deletes, and bursts of notifications
//! for the same (operation, path) pair coalesce into a single event per
//! debounce window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::protocol::Op;

/// Bounded delivery queue size. Events past this are dropped with a
/// warning rather than blocking the debounce timers.
pub const QUEUE_CAPACITY: usize = 100;

/// A debounced logical change, path relative to the watched root with
/// forward slashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub op: Op,
    pub path: String,
}

/// Coalesces repeated events for the same (op, path) key.
///
/// Each scheduled event starts a timer task; a newer event for the same
/// key aborts the pending timer, so only the last one in a burst fires.
struct Debouncer {
    window: Duration,
    pending: Arc<Mutex<HashMap<(Op, String), JoinHandle<()>>>>,
    /// Cleared on teardown so the delivery queue closes once every
    /// pending timer is gone.
    tx: Mutex<Option<mpsc::Sender<FileEvent>>>,
}

impl Debouncer {
    fn new(window: Duration, tx: mpsc::Sender<FileEvent>) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            tx: Mutex::new(Some(tx)),
        }
    }

    fn schedule(&self, event: FileEvent) {
        let Some(tx) = self.tx.lock().clone() else {
            return;
        };

        let key = (event.op, event.path.clone());
        let pending = self.pending.clone();
        let window = self.window;
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            pending.lock().remove(&task_key);
            if tx.try_send(event.clone()).is_err() {
                tracing::warn!(op = %event.op, path = %event.path, "event queue full, dropping event");
            }
        });

        if let Some(old) = self.pending.lock().insert(key, handle) {
            old.abort();
        }
    }

    fn clear(&self) {
        for (_, handle) in self.pending.lock().drain() {
            handle.abort();
        }
        self.tx.lock().take();
    }
}

/// Recursive watcher over one directory tree.
pub struct FileWatcher {
    base: PathBuf,
    watcher: Option<RecommendedWatcher>,
    event_rx: Option<mpsc::Receiver<FileEvent>>,
    debouncer: Arc<Debouncer>,
    bridge: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Start watching `base` recursively. Subdirectories created later are
    /// covered by the recursive mode without re-registration.
    pub fn new(base: impl Into<PathBuf>, debounce: Duration) -> Result<Self, SyncError> {
        let base = base.into();

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let debouncer = Arc::new(Debouncer::new(debounce, tx));

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(watch_error)?;

        watcher
            .watch(&base, RecursiveMode::Recursive)
            .map_err(watch_error)?;

        tracing::info!(path = %base.display(), "watching directory");

        let bridge_base = base.clone();
        let bridge_debouncer = debouncer.clone();
        let bridge = tokio::spawn(async move {
            while let Some(res) = raw_rx.recv().await {
                match res {
                    Ok(event) => {
                        for file_event in translate(&bridge_base, &event) {
                            tracing::debug!(op = %file_event.op, path = %file_event.path, "raw change detected");
                            bridge_debouncer.schedule(file_event);
                        }
                    }
                    Err(e) => tracing::warn!("watch error: {}", e),
                }
            }
        });

        Ok(Self {
            base,
            watcher: Some(watcher),
            event_rx: Some(rx),
            debouncer,
            bridge: Some(bridge),
        })
    }

    /// Directory this watcher covers.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Take the debounced event stream. Yields `None` after `stop`.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<FileEvent>> {
        self.event_rx.take()
    }

    /// Drop the OS watcher, cancel pending debounce timers, and close the
    /// event stream.
    pub fn stop(&mut self) {
        self.watcher = None;
        if let Some(bridge) = self.bridge.take() {
            bridge.abort();
        }
        self.debouncer.clear();
        tracing::info!(path = %self.base.display(), "watcher stopped");
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_error(e: notify::Error) -> SyncError {
    SyncError::FileSystem(std::io::Error::new(
        std::io::ErrorKind::Other,
        e.to_string(),
    ))
}

/// Map a raw notification to logical events, one per affected path.
fn translate(base: &Path, event: &notify::Event) -> Vec<FileEvent> {
    let Some(op) = classify(&event.kind) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for path in &event.paths {
        if is_ignored(path) {
            continue;
        }
        // Directory creation and metadata churn on directories are not
        // sync events; their contents produce their own notifications.
        if op != Op::Delete && path.is_dir() {
            continue;
        }
        if let Some(rel) = relative_path(base, path) {
            out.push(FileEvent {
                op,
                path: rel,
            });
        }
    }
    out
}

/// Classify a notification kind. Renames surface as deletes of the old
/// name; the new name arrives as its own create.
fn classify(kind: &EventKind) -> Option<Op> {
    match kind {
        EventKind::Create(_) => Some(Op::Create),
        EventKind::Modify(ModifyKind::Name(_)) => Some(Op::Delete),
        EventKind::Modify(_) => Some(Op::Modify),
        EventKind::Remove(_) => Some(Op::Delete),
        _ => None,
    }
}

/// Hidden files (dot-prefixed) and editor temp files (`~` suffix) are
/// never replicated.
pub(crate) fn is_ignored(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.starts_with('.') || name.ends_with('~'),
        None => true,
    }
}

fn relative_path(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

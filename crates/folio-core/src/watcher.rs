//! Local change watcher
//!
//! Observes the library root and turns filesystem notifications into
//! per-path `LocalChange`s. Bursts of events for the same path are
//! collapsed until that path has been quiet for the debounce period; each
//! path keeps its own deadline.
//!
//! Renames are reported as `Removed(old)` followed by `Changed(new)`.
//! Temporary files from atomic writes are never reported.
//!
//! `SuppressionWindow` is the coordinator's record of paths it is writing
//! itself, so that applying a remote change does not bounce back as an
//! upload. Once a write is done, a change is only treated as the engine's
//! own while the path still holds what the engine put there.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{SyncError, SyncResult};
use crate::library::{is_temporary, LocalLibrary};

/// Default quiet period before a burst of events is delivered
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// A change observed in the library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    /// Created or modified
    Changed(String),
    /// Deleted or moved away
    Removed(String),
}

impl LocalChange {
    pub fn path(&self) -> &str {
        match self {
            LocalChange::Changed(p) | LocalChange::Removed(p) => p,
        }
    }
}

/// Map a raw notification to library changes
pub fn classify(library: &LocalLibrary, event: &Event) -> Vec<LocalChange> {
    let relative = |path: &PathBuf| -> Option<String> {
        if is_temporary(path) {
            return None;
        }
        library.relative(path)
    };

    let changed = |paths: &[PathBuf]| -> Vec<LocalChange> {
        paths
            .iter()
            .filter_map(relative)
            .map(LocalChange::Changed)
            .collect()
    };
    let removed = |paths: &[PathBuf]| -> Vec<LocalChange> {
        paths
            .iter()
            .filter_map(relative)
            .map(LocalChange::Removed)
            .collect()
    };

    match &event.kind {
        EventKind::Create(_) => changed(&event.paths),
        EventKind::Remove(_) => removed(&event.paths),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let mut changes = removed(&event.paths[..1]);
            changes.extend(changed(&event.paths[1..]));
            changes
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => removed(&event.paths),
        EventKind::Modify(_) => changed(&event.paths),
        _ => Vec::new(),
    }
}

/// Watches a library root
///
/// Dropping the watcher stops observation.
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    changes: mpsc::Receiver<LocalChange>,
    debounce_task: JoinHandle<()>,
}

impl LocalWatcher {
    /// Start watching the library root recursively
    pub fn start(library: &LocalLibrary, debounce: Duration) -> SyncResult<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(256);

        let callback_library = library.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in classify(&callback_library, &event) {
                    let _ = raw_tx.send(change);
                }
            }
            Err(e) => error!("Watch error: {}", e),
        })
        .map_err(|e| watch_error(library, e))?;

        watcher
            .watch(library.root(), RecursiveMode::Recursive)
            .map_err(|e| watch_error(library, e))?;
        info!("Watching {}", library.root().display());

        let debounce_task = tokio::spawn(debounce_loop(raw_rx, out_tx, debounce));

        Ok(Self {
            _watcher: watcher,
            changes: out_rx,
            debounce_task,
        })
    }

    /// Wait for the next change
    pub async fn next(&mut self) -> Option<LocalChange> {
        self.changes.recv().await
    }
}

impl Drop for LocalWatcher {
    fn drop(&mut self) {
        self.debounce_task.abort();
    }
}

fn watch_error(library: &LocalLibrary, error: notify::Error) -> SyncError {
    SyncError::io(
        library.root(),
        std::io::Error::other(format!("failed to watch library: {}", error)),
    )
}

/// Collapse bursts of changes per path and forward each once it is quiet
async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<LocalChange>,
    out_tx: mpsc::Sender<LocalChange>,
    window: Duration,
) {
    // Latest change per path and when it becomes due
    let mut pending: BTreeMap<String, (LocalChange, Instant)> = BTreeMap::new();

    loop {
        let next_due = pending.values().map(|(_, due)| *due).min();
        let wake = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now));

        tokio::select! {
            next = raw_rx.recv() => match next {
                Some(change) => {
                    let due = Instant::now() + window;
                    pending.insert(change.path().to_string(), (change, due));
                }
                None => {
                    flush(&mut pending, &out_tx, None).await;
                    return;
                }
            },
            _ = wake, if next_due.is_some() => {
                if !flush(&mut pending, &out_tx, Some(Instant::now())).await {
                    return;
                }
            }
        }
    }
}

/// Forward changes due by `now`, or all of them
async fn flush(
    pending: &mut BTreeMap<String, (LocalChange, Instant)>,
    out_tx: &mpsc::Sender<LocalChange>,
    now: Option<Instant>,
) -> bool {
    let due: Vec<String> = pending
        .iter()
        .filter(|(_, (_, due))| now.map_or(true, |now| *due <= now))
        .map(|(path, _)| path.clone())
        .collect();

    for path in due {
        let Some((change, _)) = pending.remove(&path) else {
            continue;
        };
        debug!("Local change: {:?}", change);
        if out_tx.send(change).await.is_err() {
            return false;
        }
    }
    true
}

/// What the engine left at a path when it let go of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Written {
    /// A file with this content hash
    File(String),
    Directory,
    Removed,
    /// The write failed or never started
    Nothing,
}

/// Paths the engine is writing, and recently wrote
///
/// A held path is suppressed, and so is anything beneath it. For `grace`
/// after release a change is suppressed only while the library still shows
/// what the engine wrote; any other content is a real edit.
#[derive(Debug)]
pub struct SuppressionWindow {
    held: HashMap<String, usize>,
    released: HashMap<String, (Instant, Written)>,
    grace: Duration,
}

impl SuppressionWindow {
    pub fn new(grace: Duration) -> Self {
        Self {
            held: HashMap::new(),
            released: HashMap::new(),
            grace,
        }
    }

    pub fn hold(&mut self, path: &str) {
        *self.held.entry(path.to_string()).or_insert(0) += 1;
        self.released.remove(path);
    }

    pub fn release(&mut self, path: &str, written: Written) {
        let Some(count) = self.held.get_mut(path) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.held.remove(path);
        if written != Written::Nothing {
            self.released
                .insert(path.to_string(), (Instant::now(), written));
        }
    }

    /// Whether a change at `path` is the engine's own write
    pub fn is_suppressed(&mut self, library: &LocalLibrary, path: &str) -> bool {
        let grace = self.grace;
        self.released.retain(|_, (at, _)| at.elapsed() < grace);

        if lineage(path).any(|p| self.held.contains_key(p)) {
            return true;
        }
        if let Some((_, written)) = self.released.get(path) {
            return still_written(library, path, written);
        }

        // Children of a directory the engine removed
        lineage(path)
            .skip(1)
            .any(|p| matches!(self.released.get(p), Some((_, Written::Removed))))
            && !library.exists(path)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// A path followed by each of its ancestors
fn lineage(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(path), |p| p.rsplit_once('/').map(|(parent, _)| parent))
}

fn still_written(library: &LocalLibrary, path: &str, written: &Written) -> bool {
    match written {
        Written::File(hash) => library.hash(path).is_ok_and(|current| current == *hash),
        Written::Directory => matches!(library.entry(path), Ok(Some(entry)) if entry.is_directory),
        Written::Removed => !library.exists(path),
        Written::Nothing => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_classify_basic_kinds() {
        let library = LocalLibrary::new("/lib");

        assert_eq!(
            classify(&library, &event(EventKind::Create(CreateKind::File), &["/lib/a.md"])),
            vec![LocalChange::Changed("a.md".into())]
        );
        assert_eq!(
            classify(
                &library,
                &event(
                    EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                    &["/lib/n/b.md"]
                )
            ),
            vec![LocalChange::Changed("n/b.md".into())]
        );
        assert_eq!(
            classify(&library, &event(EventKind::Remove(RemoveKind::File), &["/lib/c.md"])),
            vec![LocalChange::Removed("c.md".into())]
        );
    }

    #[test]
    fn test_classify_rename_is_remove_then_change() {
        let library = LocalLibrary::new("/lib");
        let changes = classify(
            &library,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/lib/old.md", "/lib/new.md"],
            ),
        );
        assert_eq!(
            changes,
            vec![
                LocalChange::Removed("old.md".into()),
                LocalChange::Changed("new.md".into()),
            ]
        );
    }

    #[test]
    fn test_classify_ignores_temp_and_outside_paths() {
        let library = LocalLibrary::new("/lib");
        assert!(classify(
            &library,
            &event(EventKind::Create(CreateKind::File), &["/lib/.a.md.folio-tmp"])
        )
        .is_empty());
        assert!(classify(
            &library,
            &event(EventKind::Create(CreateKind::File), &["/elsewhere/a.md"])
        )
        .is_empty());

        // Atomic write: temp file renamed over the target
        assert_eq!(
            classify(
                &library,
                &event(
                    EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                    &["/lib/.a.md.folio-tmp", "/lib/a.md"],
                )
            ),
            vec![LocalChange::Changed("a.md".into())]
        );
    }

    #[test]
    fn test_suppression_hold_and_grace() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        library.write_atomic("a.md", b"engine", None).unwrap();

        let mut window = SuppressionWindow::new(Duration::from_millis(50));
        assert!(!window.is_suppressed(&library, "a.md"));

        window.hold("a.md");
        assert!(window.is_suppressed(&library, "a.md"));
        assert!(!window.is_suppressed(&library, "b.md"));

        window.release("a.md", Written::File(hasher::hash_bytes(b"engine")));
        assert_eq!(window.held_count(), 0);
        assert!(window.is_suppressed(&library, "a.md"));

        std::thread::sleep(Duration::from_millis(80));
        assert!(!window.is_suppressed(&library, "a.md"));
    }

    #[test]
    fn test_suppression_lets_different_content_through() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        library.write_atomic("a.md", b"engine", None).unwrap();

        let mut window = SuppressionWindow::new(Duration::from_secs(60));
        window.hold("a.md");
        window.release("a.md", Written::File(hasher::hash_bytes(b"engine")));
        assert!(window.is_suppressed(&library, "a.md"));

        library.write_atomic("a.md", b"user edit", None).unwrap();
        assert!(!window.is_suppressed(&library, "a.md"));

        // A failed write leaves nothing to suppress
        window.hold("b.md");
        window.release("b.md", Written::Nothing);
        library.write_atomic("b.md", b"user", None).unwrap();
        assert!(!window.is_suppressed(&library, "b.md"));
    }

    #[test]
    fn test_suppression_removed_and_directories() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        let mut window = SuppressionWindow::new(Duration::from_secs(60));

        window.hold("gone");
        window.release("gone", Written::Removed);
        assert!(window.is_suppressed(&library, "gone"));
        assert!(window.is_suppressed(&library, "gone/a.md"));

        library.write_atomic("gone/a.md", b"recreated", None).unwrap();
        assert!(!window.is_suppressed(&library, "gone"));
        assert!(!window.is_suppressed(&library, "gone/a.md"));

        library.create_dir("made").unwrap();
        window.hold("made");
        window.release("made", Written::Directory);
        assert!(window.is_suppressed(&library, "made"));
        assert!(!window.is_suppressed(&library, "made/new.md"));
    }

    #[test]
    fn test_suppression_nested_holds_and_children() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        let mut window = SuppressionWindow::new(Duration::from_millis(0));

        window.hold("notes");
        window.hold("notes");
        assert!(window.is_suppressed(&library, "notes/deep/a.md"));

        window.release("notes", Written::Directory);
        assert!(window.is_suppressed(&library, "notes"));
        window.release("notes", Written::Directory);
        assert!(!window.is_suppressed(&library, "notes/deep/a.md"));
    }

    #[tokio::test]
    async fn test_debounce_collapses_bursts() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(16);
        tokio::spawn(debounce_loop(raw_rx, out_tx, Duration::from_millis(50)));

        raw_tx.send(LocalChange::Changed("a.md".into())).unwrap();
        raw_tx.send(LocalChange::Changed("a.md".into())).unwrap();
        raw_tx.send(LocalChange::Removed("a.md".into())).unwrap();
        raw_tx.send(LocalChange::Changed("b.md".into())).unwrap();

        assert_eq!(out_rx.recv().await, Some(LocalChange::Removed("a.md".into())));
        assert_eq!(out_rx.recv().await, Some(LocalChange::Changed("b.md".into())));

        drop(raw_tx);
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_debounce_busy_path_does_not_hold_back_others() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(16);
        tokio::spawn(debounce_loop(raw_rx, out_tx, Duration::from_millis(100)));

        raw_tx.send(LocalChange::Changed("quiet.md".into())).unwrap();
        let busy = tokio::spawn(async move {
            for _ in 0..40 {
                if raw_tx.send(LocalChange::Changed("busy.md".into())).is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let first = tokio::time::timeout(Duration::from_millis(500), out_rx.recv())
            .await
            .expect("quiet path held back by a busy one");
        assert_eq!(first, Some(LocalChange::Changed("quiet.md".into())));
        busy.abort();
    }

    #[tokio::test]
    async fn test_watcher_reports_new_file() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        let library = LocalLibrary::new(&root);

        let mut watcher = LocalWatcher::start(&library, Duration::from_millis(50)).unwrap();
        std::fs::write(root.join("fresh.md"), b"hello").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match watcher.next().await {
                    Some(change) if change.path() == "fresh.md" => return change,
                    Some(_) => continue,
                    None => panic!("watcher ended"),
                }
            }
        })
        .await
        .expect("no event for new file");

        assert_eq!(change, LocalChange::Changed("fresh.md".into()));
    }
}

//! Sync coordinator
//!
//! One `SyncCoordinator` per library root. Its engine task is the only
//! thing that mutates files for that root: the realtime channel, the local
//! watcher and control requests all reach it as messages and are handled
//! one at a time.
//!
//! ## Lifecycle
//!
//! ```text
//! OutOfSync --start--> Synchronizing --pass ok, connected--> Synchronized
//! Synchronized --disconnect--> OutOfSync --reconnect attempt--> Synchronizing
//! ```
//!
//! On start the engine runs a reconciliation pass, opens the channel and
//! enables the watcher. Every time the channel connects, the first time
//! included, it reconciles again so that notifications missed while
//! disconnected cannot leave the library diverged. A pass that fails
//! outright is retried after `reconcile_retry_delay`. When the channel
//! gives up reconnecting the engine stops until `start` is called again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{
    channel_url, spawn_channel, ChannelConfig, ChannelEvent, ChannelHandle, ChannelStatus,
};
use crate::config::{MetadataFailurePolicy, SyncSettings};
use crate::conflict::{ConflictDecider, Resolution};
use crate::error::{SyncError, SyncResult};
use crate::executor::{Applied, Executor, ReconcileReport};
use crate::library::LocalLibrary;
use crate::models::{ChangeEvent, ChangeKind, SyncPhase, SyncState};
use crate::reconcile::Reconciler;
use crate::remote::{HttpRemote, RemoteStore};
use crate::transfer::TransferClient;
use crate::watcher::{LocalChange, LocalWatcher, SuppressionWindow, Written};

/// Progress reported by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(SyncState),
    ChannelStatus(ChannelStatus),
    PassStarted,
    PassCompleted(ReconcileReport),
    PassFailed(String),
    Uploaded(String),
    Downloaded(String),
    DirectoryCreated(String),
    RemovedLocally(String),
    DeletedRemotely(String),
    ConflictResolved { path: String, resolution: Resolution },
    Error { path: Option<String>, message: String },
}

/// Requests from the coordinator handle to its engine task
enum Control {
    Reconcile(Option<oneshot::Sender<SyncResult<ReconcileReport>>>),
    Stop,
}

/// State shared by the handle and the engine task
#[derive(Clone)]
struct Shared {
    executor: Executor,
    state: Arc<watch::Sender<SyncState>>,
    events: mpsc::Sender<EngineEvent>,
}

impl Shared {
    fn new(
        settings: &SyncSettings,
        remote: Arc<dyn RemoteStore>,
        decider: Arc<dyn ConflictDecider>,
    ) -> (Self, mpsc::Receiver<EngineEvent>) {
        let transfer = TransferClient::new(LocalLibrary::new(&settings.library_root), remote);
        let executor = Executor::new(
            transfer,
            Reconciler::new(settings.timestamp_tolerance),
            decider,
            settings.transfer_workers,
            settings.conflict_timeout,
        );
        let (state, _) = watch::channel(SyncState::default());
        let (events, event_rx) = mpsc::channel(256);

        let shared = Self {
            executor,
            state: Arc::new(state),
            events,
        };
        (shared, event_rx)
    }

    fn library(&self) -> &LocalLibrary {
        self.executor.transfer().library()
    }

    fn transfer(&self) -> &TransferClient {
        self.executor.transfer()
    }

    /// Events are dropped when nobody keeps up with them
    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("Dropped engine event: {}", e);
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        let changed = self.state.send_if_modified(|state| state.transition(phase));
        if changed {
            let state = self.state.borrow().clone();
            info!("Sync state: {}", state.phase);
            self.emit(EngineEvent::StateChanged(state));
        }
    }

    /// Move to `phase` and record why
    fn fail(&self, phase: SyncPhase, message: String) {
        self.state.send_modify(|state| {
            state.transition(phase);
            state.last_error = Some(message);
        });
        let state = self.state.borrow().clone();
        self.emit(EngineEvent::StateChanged(state));
    }

    fn note_error(&self, message: String) {
        self.state.send_modify(|state| state.last_error = Some(message));
    }

    fn report_error(&self, path: &str, error: &SyncError) {
        warn!("Sync of {} failed: {}", path, error);
        self.note_error(error.to_string());
        self.emit(EngineEvent::Error {
            path: Some(path.to_string()),
            message: error.to_string(),
        });
    }

    /// One reconciliation pass; the engine's own writes are suppressed
    async fn pass(
        &self,
        suppression: &mut SuppressionWindow,
        cancel: &watch::Receiver<bool>,
    ) -> SyncResult<ReconcileReport> {
        self.emit(EngineEvent::PassStarted);

        let plan = match self.executor.plan().await {
            Ok(plan) => plan,
            Err(e) => {
                self.emit(EngineEvent::PassFailed(e.to_string()));
                return Err(e);
            }
        };

        let held: Vec<String> = plan
            .actions
            .iter()
            .filter(|a| a.writes_locally())
            .map(|a| a.path().to_string())
            .collect();
        for path in &held {
            suppression.hold(path);
        }

        let report = self.executor.run(plan, cancel).await;

        let mut written: HashMap<&str, Written> = report
            .applied
            .iter()
            .filter_map(|applied| {
                let left = match applied {
                    Applied::Downloaded(record) => record.content_hash.clone().map(Written::File),
                    Applied::DirectoryCreated(_) => Some(Written::Directory),
                    Applied::ConflictResolved { outcome, .. } => {
                        outcome.written.clone().map(Written::File)
                    }
                    Applied::Uploaded(_) => None,
                };
                left.map(|left| (applied.path(), left))
            })
            .collect();
        for path in &held {
            let left = written.remove(path.as_str()).unwrap_or(Written::Nothing);
            suppression.release(path, left);
        }

        for applied in &report.applied {
            self.emit(match applied {
                Applied::Uploaded(record) => EngineEvent::Uploaded(record.relative_path.clone()),
                Applied::Downloaded(record) => {
                    EngineEvent::Downloaded(record.relative_path.clone())
                }
                Applied::DirectoryCreated(path) => EngineEvent::DirectoryCreated(path.clone()),
                Applied::ConflictResolved {
                    path, resolution, ..
                } => EngineEvent::ConflictResolved {
                    path: path.clone(),
                    resolution: *resolution,
                },
            });
        }
        for failure in &report.failures {
            self.emit(EngineEvent::Error {
                path: Some(failure.path.clone()),
                message: failure.message.clone(),
            });
        }
        self.emit(EngineEvent::PassCompleted(report.clone()));

        Ok(report)
    }
}

struct Running {
    control_tx: mpsc::Sender<Control>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Keeps one library root in sync with the server
pub struct SyncCoordinator {
    settings: SyncSettings,
    shared: Shared,
    event_rx: Option<mpsc::Receiver<EngineEvent>>,
    running: Option<Running>,
}

impl SyncCoordinator {
    pub fn new(
        settings: SyncSettings,
        remote: Arc<dyn RemoteStore>,
        decider: Arc<dyn ConflictDecider>,
    ) -> Self {
        let (shared, event_rx) = Shared::new(&settings, remote, decider);
        Self {
            settings,
            shared,
            event_rx: Some(event_rx),
            running: None,
        }
    }

    /// Create a coordinator talking to the configured HTTP server
    pub fn connect(settings: SyncSettings, decider: Arc<dyn ConflictDecider>) -> SyncResult<Self> {
        let remote = HttpRemote::new(
            &settings.server_url,
            settings.api_token.clone(),
            settings.request_timeout,
        )?;
        Ok(Self::new(settings, Arc::new(remote), decider))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn library(&self) -> &LocalLibrary {
        self.shared.library()
    }

    pub fn executor(&self) -> &Executor {
        &self.shared.executor
    }

    /// Whether the engine task is alive
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Start the engine; does nothing if it is already running
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> SyncResult<()> {
        if self.is_running() {
            debug!("Sync already running");
            return Ok(());
        }

        let channel_config = self.channel_config()?;
        let root = self.library().root();
        std::fs::create_dir_all(root).map_err(|e| SyncError::io(root, e))?;

        let (control_tx, control_rx) = mpsc::channel(8);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let engine = Engine::new(self.shared.clone(), self.settings.clone(), cancel_rx);
        let task = tokio::spawn(engine.run(control_rx, channel_config));

        self.running = Some(Running {
            control_tx,
            cancel_tx,
            task,
        });
        Ok(())
    }

    /// Stop the engine and wait for it to finish
    ///
    /// Work in progress is cancelled cooperatively; a transfer already
    /// underway completes first. Leaves the state at `OutOfSync`.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.cancel_tx.send(true);
            let _ = running.control_tx.send(Control::Stop).await;
            if let Err(e) = running.task.await {
                warn!("Sync engine ended abnormally: {}", e);
            }
        }
        self.shared.set_phase(SyncPhase::OutOfSync);
    }

    /// Ask for a full reconciliation pass
    ///
    /// When the engine is running the pass is queued; otherwise it runs now.
    pub async fn resync(&self) -> SyncResult<()> {
        match self.live() {
            Some(running) => running
                .control_tx
                .send(Control::Reconcile(None))
                .await
                .map_err(|_| SyncError::Cancelled),
            None => self.reconcile_once().await.map(|_| ()),
        }
    }

    /// Run one reconciliation pass and wait for its report
    pub async fn reconcile_once(&self) -> SyncResult<ReconcileReport> {
        if let Some(running) = self.live() {
            let (reply_tx, reply_rx) = oneshot::channel();
            running
                .control_tx
                .send(Control::Reconcile(Some(reply_tx)))
                .await
                .map_err(|_| SyncError::Cancelled)?;
            return reply_rx.await.map_err(|_| SyncError::Cancelled)?;
        }

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut suppression = SuppressionWindow::new(self.settings.suppression_grace);

        self.shared.set_phase(SyncPhase::Synchronizing);
        match self.shared.pass(&mut suppression, &cancel_rx).await {
            Ok(report) => {
                self.shared.set_phase(SyncPhase::Synchronized);
                if !report.failures.is_empty() {
                    self.shared
                        .note_error(format!("{} paths failed to sync", report.failures.len()));
                }
                Ok(report)
            }
            Err(e) => {
                self.shared.fail(SyncPhase::OutOfSync, e.to_string());
                Err(e)
            }
        }
    }

    pub fn state(&self) -> SyncState {
        self.shared.state.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.event_rx.take()
    }

    fn live(&self) -> Option<&Running> {
        self.running
            .as_ref()
            .filter(|running| !running.task.is_finished())
    }

    fn channel_config(&self) -> SyncResult<ChannelConfig> {
        let mut config = ChannelConfig::new(channel_url(&self.settings.server_url)?);
        config.api_token = self.settings.api_token.clone();
        config.initial_reconnect_delay = self.settings.initial_reconnect_delay;
        config.max_reconnect_attempts = self.settings.max_reconnect_attempts;
        Ok(config)
    }
}

/// The engine task's state
struct Engine {
    shared: Shared,
    settings: SyncSettings,
    suppression: SuppressionWindow,
    cancel: watch::Receiver<bool>,
    channel_status: ChannelStatus,
    retry_at: Option<Instant>,
}

impl Engine {
    fn new(shared: Shared, settings: SyncSettings, cancel: watch::Receiver<bool>) -> Self {
        let suppression = SuppressionWindow::new(settings.suppression_grace);
        Self {
            shared,
            settings,
            suppression,
            cancel,
            channel_status: ChannelStatus::Connecting,
            retry_at: None,
        }
    }

    async fn run(mut self, mut control_rx: mpsc::Receiver<Control>, channel_config: ChannelConfig) {
        info!("Sync starting for {}", self.shared.library().root().display());
        self.shared.set_phase(SyncPhase::Synchronizing);
        let _ = self.reconcile(None).await;

        let mut channel = spawn_channel(channel_config);
        let debounce = self.settings.watcher_debounce;
        let mut watcher = match LocalWatcher::start(self.shared.library(), debounce) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Local changes will only be picked up by full passes: {}", e);
                self.shared.note_error(e.to_string());
                self.shared.emit(EngineEvent::Error {
                    path: None,
                    message: e.to_string(),
                });
                None
            }
        };

        loop {
            let retry_at = self.retry_at;

            tokio::select! {
                cmd = control_rx.recv() => match cmd {
                    Some(Control::Reconcile(reply)) => {
                        let result = self.reconcile(Some(&channel)).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Some(Control::Stop) | None => break,
                },

                event = channel.event_rx.recv() => match event {
                    Some(event) => {
                        if !self.handle_channel_event(event, &channel).await {
                            break;
                        }
                    }
                    None => break,
                },

                change = next_change(&mut watcher) => match change {
                    Some(change) => {
                        for event in self.apply_local(change).await {
                            channel.notify(event);
                        }
                    }
                    None => watcher = None,
                },

                _ = retry_timer(retry_at) => {
                    info!("Retrying reconciliation");
                    let _ = self.reconcile(Some(&channel)).await;
                }
            }
        }

        drop(watcher);
        channel.shutdown().await;
        self.shared.set_phase(SyncPhase::OutOfSync);
        info!("Sync stopped");
    }

    /// Returns false when the engine should stop
    async fn handle_channel_event(&mut self, event: ChannelEvent, channel: &ChannelHandle) -> bool {
        match event {
            ChannelEvent::StatusChanged(status) => {
                self.channel_status = status;
                self.shared.emit(EngineEvent::ChannelStatus(status));
                match status {
                    ChannelStatus::Connecting => self.shared.set_phase(SyncPhase::Synchronizing),
                    ChannelStatus::Disconnected => self.shared.set_phase(SyncPhase::OutOfSync),
                    ChannelStatus::Connected => {}
                }
            }
            ChannelEvent::Connected { session } => {
                info!("Channel session {} open, reconciling", session);
                let _ = self.reconcile(Some(channel)).await;
            }
            ChannelEvent::Remote(change) => self.apply_remote(change).await,
            ChannelEvent::Error(message) => {
                self.shared.note_error(message.clone());
                self.shared.emit(EngineEvent::Error {
                    path: None,
                    message,
                });
            }
            ChannelEvent::GaveUp { attempts } => {
                let message = format!("realtime channel gave up after {} attempts", attempts);
                warn!("{}, stopping sync", message);
                self.shared.fail(SyncPhase::OutOfSync, message.clone());
                self.shared.emit(EngineEvent::Error {
                    path: None,
                    message,
                });
                return false;
            }
        }
        true
    }

    async fn reconcile(&mut self, channel: Option<&ChannelHandle>) -> SyncResult<ReconcileReport> {
        self.retry_at = None;
        self.shared.set_phase(SyncPhase::Synchronizing);

        match self.shared.pass(&mut self.suppression, &self.cancel).await {
            Ok(report) => {
                if let Some(channel) = channel {
                    for event in uploads(&report) {
                        channel.notify(event);
                    }
                }

                if report.cancelled == 0 {
                    let phase = match self.channel_status {
                        ChannelStatus::Connected => SyncPhase::Synchronized,
                        ChannelStatus::Connecting => SyncPhase::Synchronizing,
                        ChannelStatus::Disconnected => SyncPhase::OutOfSync,
                    };
                    self.shared.set_phase(phase);
                    if !report.failures.is_empty() {
                        self.shared
                            .note_error(format!("{} paths failed to sync", report.failures.len()));
                    }
                }
                Ok(report)
            }
            Err(e) => {
                warn!("Reconciliation failed: {}", e);
                self.shared.fail(SyncPhase::OutOfSync, e.to_string());
                self.retry_at = Some(Instant::now() + self.settings.reconcile_retry_delay);
                Err(e)
            }
        }
    }

    /// Apply a change pushed by another client
    async fn apply_remote(&mut self, event: ChangeEvent) {
        let path = event.path().to_string();
        let library = self.shared.library().clone();

        match event.kind {
            ChangeKind::Created | ChangeKind::Updated if event.record.is_directory => {
                self.suppression.hold(&path);
                let result = library.create_dir(&path);
                match result {
                    Ok(()) => {
                        self.suppression.release(&path, Written::Directory);
                        self.shared.emit(EngineEvent::DirectoryCreated(path));
                    }
                    Err(e) => {
                        self.suppression.release(&path, Written::Nothing);
                        self.shared.report_error(&path, &e);
                    }
                }
            }
            ChangeKind::Created | ChangeKind::Updated => {
                if let Ok(local_hash) = library.hash(&path) {
                    if event.record.has_hash(&local_hash) {
                        debug!("{} already up to date", path);
                        return;
                    }
                }

                // A record without a usable timestamp leaves the local mtime alone
                let record = Some(&event.record).filter(|r| r.modified_time.timestamp() > 0);

                self.suppression.hold(&path);
                let result = self.shared.transfer().download(&path, record).await;
                match result {
                    Ok(hash) => {
                        self.suppression.release(&path, Written::File(hash));
                        self.shared.emit(EngineEvent::Downloaded(path));
                    }
                    Err(e) => {
                        self.suppression.release(&path, Written::Nothing);
                        self.shared.report_error(&path, &e);
                    }
                }
            }
            ChangeKind::Deleted => {
                if !library.exists(&path) {
                    return;
                }
                self.suppression.hold(&path);
                let result = library.remove(&path);
                let left = match result {
                    Ok(true) => Written::Removed,
                    _ => Written::Nothing,
                };
                self.suppression.release(&path, left);
                match result {
                    Ok(true) => self.shared.emit(EngineEvent::RemovedLocally(path)),
                    Ok(false) => {}
                    Err(e) => self.shared.report_error(&path, &e),
                }
            }
        }
    }

    /// Push a local change to the server
    ///
    /// Returns the notifications to send to other clients.
    async fn apply_local(&mut self, change: LocalChange) -> Vec<ChangeEvent> {
        let path = change.path().to_string();
        if self
            .suppression
            .is_suppressed(self.shared.library(), &path)
        {
            debug!("Ignoring own write to {}", path);
            return Vec::new();
        }

        match change {
            LocalChange::Changed(_) => match self.shared.library().entry(&path) {
                Ok(Some(entry)) if entry.is_directory => self.upload_tree(&path).await,
                Ok(Some(_)) => self.upload_if_changed(&path).await.into_iter().collect(),
                Ok(None) if self.shared.library().exists(&path) => {
                    debug!("{} is not a regular file, ignoring", path);
                    Vec::new()
                }
                // Gone again by the time we looked
                Ok(None) => self.delete_remote(&path).await.into_iter().collect(),
                Err(e) => {
                    self.shared.report_error(&path, &e);
                    Vec::new()
                }
            },
            LocalChange::Removed(_) => {
                if self.shared.library().exists(&path) {
                    debug!("{} reappeared, leaving it to its own change event", path);
                    return Vec::new();
                }
                self.delete_remote(&path).await.into_iter().collect()
            }
        }
    }

    /// Upload unless the server already has this content
    async fn upload_if_changed(&mut self, path: &str) -> Option<ChangeEvent> {
        let local_hash = match self.shared.library().hash(path) {
            Ok(hash) => hash,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                self.shared.report_error(path, &e);
                return None;
            }
        };

        let kind = match self.shared.transfer().remote_metadata(path).await {
            Ok(Some(remote)) if remote.has_hash(&local_hash) => {
                debug!("{} unchanged, not uploading", path);
                return None;
            }
            Ok(Some(_)) => ChangeKind::Updated,
            Ok(None) => ChangeKind::Created,
            Err(e) => match self.settings.metadata_failure_policy {
                MetadataFailurePolicy::Upload => {
                    warn!("Metadata lookup for {} failed, uploading anyway: {}", path, e);
                    ChangeKind::Updated
                }
                MetadataFailurePolicy::Skip => {
                    warn!(
                        "Metadata lookup for {} failed, leaving it for the next pass: {}",
                        path, e
                    );
                    return None;
                }
            },
        };

        match self.shared.transfer().upload(path).await {
            Ok(record) => {
                self.shared.emit(EngineEvent::Uploaded(path.to_string()));
                Some(ChangeEvent::new(kind, record))
            }
            Err(e) => {
                self.shared.report_error(path, &e);
                None
            }
        }
    }

    /// A directory appeared; upload the files inside it
    async fn upload_tree(&mut self, dir: &str) -> Vec<ChangeEvent> {
        let prefix = format!("{}/", dir);
        let scan = match self.shared.library().scan() {
            Ok(scan) => scan,
            Err(e) => {
                self.shared.report_error(dir, &e);
                return Vec::new();
            }
        };
        for (path, error) in &scan.unreadable {
            if path.starts_with(&prefix) {
                self.shared.report_error(path, error);
            }
        }

        let mut events = Vec::new();
        for entry in scan
            .entries
            .into_iter()
            .filter(|e| !e.is_directory && e.relative_path.starts_with(&prefix))
        {
            if self
                .suppression
                .is_suppressed(self.shared.library(), &entry.relative_path)
            {
                continue;
            }
            if let Some(event) = self.upload_if_changed(&entry.relative_path).await {
                events.push(event);
            }
        }
        events
    }

    async fn delete_remote(&mut self, path: &str) -> Option<ChangeEvent> {
        match self.shared.transfer().delete(path).await {
            Ok(()) => {
                self.shared.emit(EngineEvent::DeletedRemotely(path.to_string()));
                Some(ChangeEvent::deleted(path))
            }
            Err(e) => {
                self.shared.report_error(path, &e);
                None
            }
        }
    }
}

/// Notifications for everything a pass sent to the server
fn uploads(report: &ReconcileReport) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for applied in &report.applied {
        match applied {
            Applied::Uploaded(record) => {
                events.push(ChangeEvent::new(ChangeKind::Updated, record.clone()));
            }
            Applied::ConflictResolved { path, outcome, .. } => {
                for record in &outcome.uploaded {
                    // Anything but the conflicted path is a new conflict copy
                    let kind = if &record.relative_path == path {
                        ChangeKind::Updated
                    } else {
                        ChangeKind::Created
                    };
                    events.push(ChangeEvent::new(kind, record.clone()));
                }
            }
            Applied::Downloaded(_) | Applied::DirectoryCreated(_) => {}
        }
    }
    events
}

async fn next_change(watcher: &mut Option<LocalWatcher>) -> Option<LocalChange> {
    match watcher {
        Some(watcher) => watcher.next().await,
        None => std::future::pending().await,
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

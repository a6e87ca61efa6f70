//! Folio Core Library
//!
//! This crate keeps a local document library in two-way sync with a
//! library server.
//!
//! # Architecture
//!
//! - **Reconciliation**: full passes compare the local tree with the remote
//!   catalog by content hash, then by modification time
//! - **Realtime channel**: a WebSocket carries change notifications both
//!   ways; every (re)connection triggers a full pass
//! - **Local watcher**: filesystem events are uploaded as they happen,
//!   minus the engine's own writes
//!
//! # Quick Start
//!
//! ```text
//! let settings = Config::load()?.sync_settings()?;
//! let mut coordinator = SyncCoordinator::connect(settings, Arc::new(FixedPolicy(Resolution::KeepBoth)))?;
//!
//! coordinator.start()?;
//! let mut states = coordinator.subscribe();
//! ```
//!
//! # Modules
//!
//! - `coordinator`: engine lifecycle and state (main entry point)
//! - `executor`: reconciliation passes
//! - `reconcile`: planning rules
//! - `conflict`: conflict resolutions and the decision port
//! - `channel`: realtime change channel
//! - `watcher`: local change watcher and suppression
//! - `remote`, `transfer`: server access
//! - `library`, `hasher`: local filesystem access
//! - `config`: application configuration

pub mod channel;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod hasher;
pub mod library;
pub mod models;
pub mod reconcile;
pub mod remote;
pub mod transfer;
pub mod watcher;

pub use config::{Config, ConflictPolicy, MetadataFailurePolicy, SyncSettings};
pub use conflict::{
    conflict_copy_path, conflict_port, Conflict, ConflictDecider, ConflictPort, ConflictRequest,
    FixedPolicy, Resolution, Resolved,
};
pub use coordinator::{EngineEvent, SyncCoordinator};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use executor::{ReconcileReport, TransferFailure};
pub use library::{LocalLibrary, Scan};
pub use models::{ChangeEvent, ChangeKind, FileRecord, SyncPhase, SyncState};
pub use reconcile::{Plan, Reconciler, SyncAction};
pub use remote::{HttpRemote, RemoteStore};

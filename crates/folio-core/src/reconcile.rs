//! Reconciliation
//!
//! Compares the local tree with the remote catalog and produces the set of
//! transfers that brings both sides together.
//!
//! ## Rules
//!
//! For every path present on at least one side:
//!
//! 1. Local only: upload (directories need no action, the server creates
//!    parents on upload).
//! 2. Remote only, directory: create it locally.
//! 3. Remote only, file: download.
//! 4. Both sides, files:
//!    a. Equal hashes: nothing to do, whatever the timestamps say.
//!    b. Modification times within the tolerance: conflict.
//!    c. Local newer: upload.
//!    d. Remote newer: download.
//!    e. Otherwise: conflict.
//!
//! Hash equality is checked before any timestamp comparison. Local hashes
//! are computed lazily, only for files present on both sides.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::conflict::Conflict;
use crate::error::{SyncError, SyncResult};
use crate::library::LocalEntry;
use crate::models::FileRecord;

/// Default window within which two modification times are too close to order
pub const DEFAULT_TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(2);

/// One corrective step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Upload { path: String },
    Download { record: FileRecord },
    CreateDirectory { path: String },
    Conflict(Conflict),
}

impl SyncAction {
    pub fn path(&self) -> &str {
        match self {
            SyncAction::Upload { path } | SyncAction::CreateDirectory { path } => path,
            SyncAction::Download { record } => &record.relative_path,
            SyncAction::Conflict(conflict) => &conflict.path,
        }
    }

    /// Whether carrying out this action writes to the local library
    pub fn writes_locally(&self) -> bool {
        !matches!(self, SyncAction::Upload { .. })
    }
}

/// A path that could not be planned
#[derive(Debug)]
pub struct PlanFailure {
    pub path: String,
    pub error: SyncError,
}

/// Result of comparing both sides
#[derive(Debug, Default)]
pub struct Plan {
    pub actions: Vec<SyncAction>,
    pub failures: Vec<PlanFailure>,
    /// Paths already converged
    pub unchanged: usize,
    /// Paths skipped because they are a file on one side and a directory on the other
    pub mismatched: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn count(&self, predicate: impl Fn(&SyncAction) -> bool) -> usize {
        self.actions.iter().filter(|a| predicate(a)).count()
    }
}

/// Outcome of comparing one file present on both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    InSync,
    Upload,
    Download,
    Conflict,
}

/// Apply rule 4 to a file present on both sides
pub fn decide(
    local_hash: &str,
    local_modified: DateTime<Utc>,
    remote: &FileRecord,
    tolerance: Duration,
) -> Decision {
    if remote.has_hash(local_hash) {
        return Decision::InSync;
    }

    let delta_ms = (local_modified - remote.modified_time).num_milliseconds();
    let tolerance_ms = i64::try_from(tolerance.as_millis()).unwrap_or(i64::MAX);

    if delta_ms.abs() <= tolerance_ms {
        Decision::Conflict
    } else if delta_ms > 0 {
        Decision::Upload
    } else if delta_ms < 0 {
        Decision::Download
    } else {
        Decision::Conflict
    }
}

/// Plans reconciliation passes
#[derive(Debug, Clone)]
pub struct Reconciler {
    tolerance: Duration,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_TIMESTAMP_TOLERANCE)
    }
}

impl Reconciler {
    pub fn new(tolerance: Duration) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Compare the local tree against the remote catalog
    ///
    /// `hash` is called only for files present on both sides. A hashing
    /// failure skips that path and is recorded in `Plan::failures`.
    pub fn plan<F>(&self, local: &[LocalEntry], remote: &[FileRecord], mut hash: F) -> Plan
    where
        F: FnMut(&str) -> SyncResult<String>,
    {
        let local: BTreeMap<&str, &LocalEntry> = local
            .iter()
            .map(|e| (e.relative_path.as_str(), e))
            .collect();
        let remote: BTreeMap<&str, &FileRecord> = remote
            .iter()
            .filter(|r| !r.relative_path.is_empty())
            .map(|r| (r.relative_path.as_str(), r))
            .collect();

        let mut paths: Vec<&str> = local.keys().chain(remote.keys()).copied().collect();
        paths.sort_unstable();
        paths.dedup();

        let mut plan = Plan::default();
        for path in paths {
            match (local.get(path), remote.get(path)) {
                (Some(entry), None) => {
                    if !entry.is_directory {
                        plan.actions.push(SyncAction::Upload {
                            path: path.to_string(),
                        });
                    }
                }
                (None, Some(record)) => {
                    let action = if record.is_directory {
                        SyncAction::CreateDirectory {
                            path: path.to_string(),
                        }
                    } else {
                        SyncAction::Download {
                            record: (*record).clone(),
                        }
                    };
                    plan.actions.push(action);
                }
                (Some(entry), Some(record)) => {
                    self.plan_both(entry, record, &mut hash, &mut plan);
                }
                (None, None) => {}
            }
        }

        debug!(
            "Planned {} actions ({} unchanged, {} failures)",
            plan.actions.len(),
            plan.unchanged,
            plan.failures.len()
        );
        plan
    }

    fn plan_both<F>(&self, entry: &LocalEntry, record: &FileRecord, hash: &mut F, plan: &mut Plan)
    where
        F: FnMut(&str) -> SyncResult<String>,
    {
        let path = entry.relative_path.as_str();

        match (entry.is_directory, record.is_directory) {
            (true, true) => {
                plan.unchanged += 1;
                return;
            }
            (true, false) | (false, true) => {
                warn!("Skipping {}: file on one side, directory on the other", path);
                plan.mismatched.push(path.to_string());
                return;
            }
            (false, false) => {}
        }

        let local_hash = match hash(path) {
            Ok(h) => h,
            Err(error) => {
                warn!("Could not hash {}: {}", path, error);
                plan.failures.push(PlanFailure {
                    path: path.to_string(),
                    error,
                });
                return;
            }
        };

        match decide(&local_hash, entry.modified_time, record, self.tolerance) {
            Decision::InSync => plan.unchanged += 1,
            Decision::Upload => plan.actions.push(SyncAction::Upload {
                path: path.to_string(),
            }),
            Decision::Download => plan.actions.push(SyncAction::Download {
                record: record.clone(),
            }),
            Decision::Conflict => plan
                .actions
                .push(SyncAction::Conflict(Conflict::new(entry, record))),
        }
    }
}

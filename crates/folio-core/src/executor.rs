//! Reconciliation passes
//!
//! One pass fetches the remote catalog, scans the library, plans with the
//! `Reconciler` and carries out the resulting actions. Actions run
//! concurrently through a bounded pool; a plan holds at most one action
//! per path, so no two transfers touch the same file.
//!
//! Cancellation is cooperative. The signal is checked before each action
//! starts and while waiting for a conflict decision; a transfer already
//! underway is left to finish.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::conflict::{apply_resolution, Conflict, ConflictDecider, Resolution, Resolved};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::library::Scan;
use crate::models::FileRecord;
use crate::reconcile::{Plan, PlanFailure, Reconciler, SyncAction};
use crate::transfer::TransferClient;

/// A path that failed during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferFailure {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl TransferFailure {
    pub fn new(path: impl Into<String>, error: &SyncError) -> Self {
        Self {
            path: path.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// An action that completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Uploaded(FileRecord),
    Downloaded(FileRecord),
    DirectoryCreated(String),
    ConflictResolved {
        path: String,
        resolution: Resolution,
        outcome: Resolved,
    },
}

impl Applied {
    pub fn path(&self) -> &str {
        match self {
            Applied::Uploaded(record) | Applied::Downloaded(record) => &record.relative_path,
            Applied::DirectoryCreated(path) | Applied::ConflictResolved { path, .. } => path,
        }
    }
}

/// Summary of one pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub uploaded: usize,
    pub downloaded: usize,
    pub directories_created: usize,
    pub conflicts_resolved: usize,
    pub unchanged: usize,
    /// File on one side, directory on the other
    pub skipped: Vec<String>,
    pub failures: Vec<TransferFailure>,
    /// Actions not started because the pass was cancelled
    pub cancelled: usize,
    #[serde(skip)]
    pub applied: Vec<Applied>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.cancelled == 0
    }

    pub fn transferred(&self) -> usize {
        self.uploaded + self.downloaded
    }

    fn record(&mut self, applied: Applied) {
        match &applied {
            Applied::Uploaded(_) => self.uploaded += 1,
            Applied::Downloaded(_) => self.downloaded += 1,
            Applied::DirectoryCreated(_) => self.directories_created += 1,
            Applied::ConflictResolved { .. } => self.conflicts_resolved += 1,
        }
        self.applied.push(applied);
    }
}

/// Runs reconciliation passes for one library
#[derive(Clone)]
pub struct Executor {
    transfer: TransferClient,
    reconciler: Reconciler,
    decider: Arc<dyn ConflictDecider>,
    workers: usize,
    conflict_timeout: Duration,
}

impl Executor {
    pub fn new(
        transfer: TransferClient,
        reconciler: Reconciler,
        decider: Arc<dyn ConflictDecider>,
        workers: usize,
        conflict_timeout: Duration,
    ) -> Self {
        Self {
            transfer,
            reconciler,
            decider,
            workers: workers.max(1),
            conflict_timeout,
        }
    }

    pub fn transfer(&self) -> &TransferClient {
        &self.transfer
    }

    /// Fetch the catalog, scan the library and plan
    ///
    /// Fails only when the catalog or the library root cannot be read.
    pub async fn plan(&self) -> SyncResult<Plan> {
        let remote = self.transfer.fetch_catalog().await?;
        let scan = self.transfer.library().scan()?;
        Ok(self.plan_scan(scan, remote))
    }

    /// Plan from a finished scan
    ///
    /// Unreadable local paths are reported as failures and left out on both
    /// sides, so a remote copy never overwrites what could not be read.
    fn plan_scan(&self, scan: Scan, remote: Vec<FileRecord>) -> Plan {
        let library = self.transfer.library();
        let local: Vec<_> = scan
            .entries
            .iter()
            .filter(|e| !scan.covers(&e.relative_path))
            .cloned()
            .collect();
        let remote: Vec<_> = remote
            .into_iter()
            .filter(|r| !scan.covers(&r.relative_path))
            .collect();

        let mut plan = self
            .reconciler
            .plan(&local, &remote, |path| library.hash(path));
        plan.failures.extend(
            scan.unreadable
                .into_iter()
                .map(|(path, error)| PlanFailure { path, error }),
        );
        plan
    }

    /// Plan and run a full pass
    pub async fn reconcile(&self, cancel: &watch::Receiver<bool>) -> SyncResult<ReconcileReport> {
        let plan = self.plan().await?;
        Ok(self.run(plan, cancel).await)
    }

    /// Carry out a plan
    pub async fn run(&self, plan: Plan, cancel: &watch::Receiver<bool>) -> ReconcileReport {
        let mut report = ReconcileReport {
            unchanged: plan.unchanged,
            skipped: plan.mismatched,
            ..Default::default()
        };
        for failure in &plan.failures {
            report
                .failures
                .push(TransferFailure::new(&failure.path, &failure.error));
        }

        if !plan.actions.is_empty() {
            info!("Reconciling {} paths", plan.actions.len());
        }

        let outcomes: Vec<(String, SyncResult<Applied>)> = stream::iter(plan.actions)
            .map(|action| {
                let cancel = cancel.clone();
                async move {
                    let path = action.path().to_string();
                    if *cancel.borrow() {
                        return (path, Err(SyncError::Cancelled));
                    }
                    let outcome = self.apply(action, cancel).await;
                    (path, outcome)
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for (path, outcome) in outcomes {
            match outcome {
                Ok(applied) => report.record(applied),
                Err(SyncError::Cancelled) => report.cancelled += 1,
                Err(e) => {
                    warn!("Failed to sync {}: {}", path, e);
                    report.failures.push(TransferFailure::new(path, &e));
                }
            }
        }

        info!(
            "Pass complete: {} up, {} down, {} conflicts, {} failures",
            report.uploaded,
            report.downloaded,
            report.conflicts_resolved,
            report.failures.len()
        );
        report
    }

    async fn apply(
        &self,
        action: SyncAction,
        cancel: watch::Receiver<bool>,
    ) -> SyncResult<Applied> {
        match action {
            SyncAction::Upload { path } => {
                let record = self.transfer.upload(&path).await?;
                Ok(Applied::Uploaded(record))
            }
            SyncAction::Download { mut record } => {
                let written = self
                    .transfer
                    .download(&record.relative_path, Some(&record))
                    .await?;
                record.content_hash = Some(written);
                Ok(Applied::Downloaded(record))
            }
            SyncAction::CreateDirectory { path } => {
                self.transfer.library().create_dir(&path)?;
                Ok(Applied::DirectoryCreated(path))
            }
            SyncAction::Conflict(conflict) => {
                let resolution = self.await_decision(&conflict, cancel).await?;
                let outcome = apply_resolution(&self.transfer, &conflict, resolution).await?;
                Ok(Applied::ConflictResolved {
                    path: conflict.path,
                    resolution,
                    outcome,
                })
            }
        }
    }

    /// Ask the decider, bounded by the conflict timeout and the cancel signal
    async fn await_decision(
        &self,
        conflict: &Conflict,
        mut cancel: watch::Receiver<bool>,
    ) -> SyncResult<Resolution> {
        let unresolved = || SyncError::ConflictUnresolved {
            path: conflict.path.clone(),
        };

        tokio::select! {
            decision = tokio::time::timeout(self.conflict_timeout, self.decider.decide(conflict)) => {
                match decision {
                    Ok(Some(resolution)) => {
                        info!("Conflict on {} resolved as {:?}", conflict.path, resolution);
                        Ok(resolution)
                    }
                    Ok(None) => Err(unresolved()),
                    Err(_) => {
                        warn!(
                            "No decision for conflict on {} within {:?}",
                            conflict.path, self.conflict_timeout
                        );
                        Err(unresolved())
                    }
                }
            }
            _ = cancelled(&mut cancel) => Err(SyncError::Cancelled),
        }
    }
}

/// Resolves once the cancel signal is raised; never if its sender is gone
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let raised = cancel.wait_for(|c| *c).await.is_ok();
    if !raised {
        std::future::pending::<()>().await;
    }
}

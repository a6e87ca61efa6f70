//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::{json, Value};

use folio_core::{EngineEvent, Plan, ReconcileReport, Resolution, SyncAction};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a reconciliation summary
    pub fn print_report(&self, report: &ReconcileReport) {
        match self.format {
            OutputFormat::Human => {
                println!("Uploaded:    {}", report.uploaded);
                println!("Downloaded:  {}", report.downloaded);
                if report.directories_created > 0 {
                    println!("Directories: {}", report.directories_created);
                }
                if report.conflicts_resolved > 0 {
                    println!("Conflicts:   {}", report.conflicts_resolved);
                }
                println!("Unchanged:   {}", report.unchanged);

                for path in &report.skipped {
                    println!("Skipped {}: file on one side, directory on the other", path);
                }
                if !report.failures.is_empty() {
                    println!();
                    println!("── Failures ({}) ──", report.failures.len());
                    for failure in &report.failures {
                        println!("{}: {}", failure.path, failure.message);
                    }
                }
            }
            OutputFormat::Json => println!("{}", json!(report)),
            OutputFormat::Quiet => {
                for failure in &report.failures {
                    eprintln!("{}: {}", failure.path, failure.message);
                }
            }
        }
    }

    /// Print a plan without running it
    pub fn print_plan(&self, plan: &Plan) {
        match self.format {
            OutputFormat::Human => {
                if plan.is_empty() {
                    println!("Nothing to do - library is in sync.");
                } else {
                    for action in &plan.actions {
                        println!("{:<9} {}", action_label(action), describe_action(action));
                    }
                }
                for path in &plan.mismatched {
                    println!("{:<9} {} (file on one side, directory on the other)", "skip", path);
                }
                for failure in &plan.failures {
                    println!("{:<9} {} ({})", "error", failure.path, failure.error);
                }
                println!();
                println!(
                    "{} action(s), {} unchanged",
                    plan.actions.len(),
                    plan.unchanged
                );
            }
            OutputFormat::Json => {
                let actions: Vec<Value> = plan
                    .actions
                    .iter()
                    .map(|a| json!({"action": action_label(a), "path": a.path()}))
                    .collect();
                let failures: Vec<Value> = plan
                    .failures
                    .iter()
                    .map(|f| json!({"path": f.path, "error": f.error.to_string()}))
                    .collect();
                println!(
                    "{}",
                    json!({
                        "actions": actions,
                        "unchanged": plan.unchanged,
                        "mismatched": plan.mismatched,
                        "failures": failures
                    })
                );
            }
            OutputFormat::Quiet => {
                for action in &plan.actions {
                    println!("{}", action.path());
                }
            }
        }
    }

    /// Print one engine event while running
    pub fn print_event(&self, event: &EngineEvent) {
        match self.format {
            OutputFormat::Human => match event {
                EngineEvent::StateChanged(state) => match &state.last_error {
                    Some(error) if state.phase != folio_core::SyncPhase::Synchronized => {
                        println!("State: {} ({})", state.phase, error)
                    }
                    _ => println!("State: {}", state.phase),
                },
                EngineEvent::Uploaded(path) => println!("↑ {}", path),
                EngineEvent::Downloaded(path) => println!("↓ {}", path),
                EngineEvent::DirectoryCreated(path) => println!("+ {}/", path),
                EngineEvent::RemovedLocally(path) => println!("- {} (local)", path),
                EngineEvent::DeletedRemotely(path) => println!("- {} (remote)", path),
                EngineEvent::ConflictResolved { path, resolution } => {
                    println!("! {} resolved: {}", path, resolution_label(*resolution))
                }
                EngineEvent::PassCompleted(report) => println!(
                    "Pass complete: {} up, {} down, {} unchanged, {} failed",
                    report.uploaded,
                    report.downloaded,
                    report.unchanged,
                    report.failures.len()
                ),
                EngineEvent::PassFailed(error) => eprintln!("Pass failed: {}", error),
                EngineEvent::Error { path, message } => match path {
                    Some(path) => eprintln!("Error: {}: {}", path, message),
                    None => eprintln!("Error: {}", message),
                },
                EngineEvent::PassStarted | EngineEvent::ChannelStatus(_) => {}
            },
            OutputFormat::Json => println!("{}", event_json(event)),
            OutputFormat::Quiet => {
                if let EngineEvent::Error { path, message } = event {
                    eprintln!("{}: {}", path.as_deref().unwrap_or("-"), message);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn action_label(action: &SyncAction) -> &'static str {
    match action {
        SyncAction::Upload { .. } => "upload",
        SyncAction::Download { .. } => "download",
        SyncAction::CreateDirectory { .. } => "mkdir",
        SyncAction::Conflict(_) => "conflict",
    }
}

fn describe_action(action: &SyncAction) -> String {
    match action {
        SyncAction::Conflict(conflict) => format!(
            "{} (local {}, remote {})",
            conflict.path,
            conflict.local_modified.format("%Y-%m-%d %H:%M:%S"),
            conflict.remote_modified.format("%Y-%m-%d %H:%M:%S")
        ),
        other => other.path().to_string(),
    }
}

pub fn resolution_label(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::KeepLocal => "kept local",
        Resolution::KeepRemote => "kept remote",
        Resolution::KeepBoth => "kept both",
    }
}

/// JSON form of an engine event, tagged by `event`
fn event_json(event: &EngineEvent) -> Value {
    match event {
        EngineEvent::StateChanged(state) => json!({"event": "state", "state": state}),
        EngineEvent::ChannelStatus(status) => {
            json!({"event": "channel", "status": format!("{:?}", status).to_lowercase()})
        }
        EngineEvent::PassStarted => json!({"event": "pass_started"}),
        EngineEvent::PassCompleted(report) => json!({"event": "pass_completed", "report": report}),
        EngineEvent::PassFailed(error) => json!({"event": "pass_failed", "error": error}),
        EngineEvent::Uploaded(path) => json!({"event": "uploaded", "path": path}),
        EngineEvent::Downloaded(path) => json!({"event": "downloaded", "path": path}),
        EngineEvent::DirectoryCreated(path) => json!({"event": "directory_created", "path": path}),
        EngineEvent::RemovedLocally(path) => json!({"event": "removed_locally", "path": path}),
        EngineEvent::DeletedRemotely(path) => json!({"event": "deleted_remotely", "path": path}),
        EngineEvent::ConflictResolved { path, resolution } => {
            json!({"event": "conflict_resolved", "path": path, "resolution": resolution})
        }
        EngineEvent::Error { path, message } => {
            json!({"event": "error", "path": path, "message": message})
        }
    }
}

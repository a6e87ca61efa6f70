//! Sync command handler

use anyhow::{bail, Result};

use folio_core::Config;

use crate::output::Output;

/// Run a single reconciliation pass
pub async fn sync(config: &Config, output: &Output) -> Result<()> {
    let coordinator = super::coordinator(config)?;

    output.message(&format!(
        "Syncing {} with {}...",
        coordinator.library().root().display(),
        coordinator.settings().server_url
    ));

    let report = match coordinator.reconcile_once().await {
        Ok(report) => report,
        Err(e) => {
            output.message(&format!("Sync failed: {}", e));
            return Err(e.into());
        }
    };

    output.print_report(&report);

    if !report.failures.is_empty() {
        bail!("{} paths failed to sync", report.failures.len());
    }
    if report.transferred() == 0 && report.conflicts_resolved == 0 {
        output.success("Sync complete - already up to date");
    } else {
        output.success("Sync complete");
    }

    Ok(())
}

//! Diff command handler

use anyhow::{Context, Result};

use folio_core::Config;

use crate::output::Output;

/// Show what a reconciliation pass would do, without changing anything
pub async fn diff(config: &Config, output: &Output) -> Result<()> {
    let coordinator = super::coordinator(config)?;
    let plan = coordinator
        .executor()
        .plan()
        .await
        .context("Failed to plan reconciliation")?;

    output.print_plan(&plan);
    Ok(())
}

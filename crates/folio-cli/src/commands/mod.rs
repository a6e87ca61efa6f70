//! Command handlers

pub mod config;
pub mod diff;
pub mod run;
pub mod status;
pub mod sync;

use anyhow::{Context, Result};

use folio_core::{Config, SyncCoordinator};

use crate::prompt::decider_for;

/// Build a coordinator for the configured library and server
pub(crate) fn coordinator(config: &Config) -> Result<SyncCoordinator> {
    let settings = config.sync_settings().context(
        "Sync is not configured. Set it up with:\n  \
         folio config set library_root ~/Library\n  \
         folio config set server_url https://your-server:8080",
    )?;
    let coordinator = SyncCoordinator::connect(settings, decider_for(config.conflict_policy))?;
    Ok(coordinator)
}

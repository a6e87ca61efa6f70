//! Run command handler

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use folio_core::Config;

use crate::output::Output;

/// How often to check that the engine is still alive
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Keep the library in sync until Ctrl-C or until the engine gives up
pub async fn run(config: &Config, output: &Output) -> Result<()> {
    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             folio config set sync_enabled true"
        );
    }

    let mut coordinator = super::coordinator(config)?;
    let mut events = coordinator
        .take_events()
        .context("Engine events already taken")?;

    coordinator.start()?;
    info!("Sync engine started");
    output.message(&format!(
        "Watching {} (Ctrl-C to stop)",
        coordinator.library().root().display()
    ));

    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let stopped_by_engine = loop {
        tokio::select! {
            _ = &mut ctrl_c => break false,
            event = events.recv() => match event {
                Some(event) => output.print_event(&event),
                None => break true,
            },
            _ = liveness.tick() => {
                if !coordinator.is_running() {
                    break true;
                }
            }
        }
    };

    // Print whatever the engine said on its way out
    while let Ok(event) = events.try_recv() {
        output.print_event(&event);
    }

    let last_error = coordinator.state().last_error;
    coordinator.stop().await;

    if stopped_by_engine {
        bail!(
            "Sync engine stopped: {}",
            last_error.as_deref().unwrap_or("unknown error")
        );
    }

    output.success("Sync stopped");
    Ok(())
}

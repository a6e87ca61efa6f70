//! Interactive conflict resolution
//!
//! Asks on the terminal which side of a conflict to keep. Without a TTY the
//! conflict is left unresolved for a later pass.
//!
//! Stdin is read by one long-lived thread that forwards lines over a
//! channel. A question abandoned on timeout leaves no reader behind, and
//! anything typed while no question is open is discarded before the next
//! one is asked.

use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use folio_core::{Conflict, ConflictDecider, ConflictPolicy, FixedPolicy, Resolution};

/// Answer to a conflict prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Resolve(Resolution),
    Skip,
}

/// Parse one line of user input
pub fn parse_answer(input: &str) -> Option<Answer> {
    match input.trim().to_lowercase().as_str() {
        "l" | "local" => Some(Answer::Resolve(Resolution::KeepLocal)),
        "r" | "remote" => Some(Answer::Resolve(Resolution::KeepRemote)),
        "b" | "both" => Some(Answer::Resolve(Resolution::KeepBoth)),
        "s" | "skip" | "" => Some(Answer::Skip),
        _ => None,
    }
}

/// Decider that asks on stdin, one conflict at a time
pub struct PromptDecider {
    /// Started on the first question; held for the whole of each question
    lines: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    interactive: bool,
}

impl PromptDecider {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(None),
            interactive: io::stdin().is_terminal(),
        }
    }

    #[cfg(test)]
    fn with_lines(lines: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            lines: Mutex::new(Some(lines)),
            interactive: true,
        }
    }
}

impl Default for PromptDecider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConflictDecider for PromptDecider {
    async fn decide(&self, conflict: &Conflict) -> Option<Resolution> {
        if !self.interactive {
            warn!("No terminal to ask about conflict on {}", conflict.path);
            return None;
        }

        // Transfers run concurrently; questions must not interleave
        let mut guard = self.lines.lock().await;
        let lines = guard.get_or_insert_with(spawn_stdin_reader);

        // Typed while nobody was asking, e.g. a late answer to a timed out question
        while lines.try_recv().is_ok() {}

        match ask(conflict, lines).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Conflict prompt failed: {}", e);
                None
            }
        }
    }
}

/// Forward stdin lines from a plain thread
///
/// The thread is detached, so a read still pending at exit does not hold up
/// runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("folio-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Could not start terminal reader: {}", e);
    }
    rx
}

async fn ask(
    conflict: &Conflict,
    lines: &mut mpsc::UnboundedReceiver<String>,
) -> io::Result<Option<Resolution>> {
    println!();
    println!("Conflict: {}", conflict.path);
    println!(
        "  local:  {} ({} bytes)",
        local_time(conflict.local_modified),
        conflict.local_size
    );
    println!(
        "  remote: {} ({} bytes)",
        local_time(conflict.remote_modified),
        conflict.remote_size
    );

    loop {
        print!("Keep [l]ocal, [r]emote, [b]oth, or [s]kip? ");
        io::stdout().flush()?;

        // End of input
        let Some(input) = lines.recv().await else {
            return Ok(None);
        };

        match parse_answer(&input) {
            Some(Answer::Resolve(resolution)) => return Ok(Some(resolution)),
            Some(Answer::Skip) => return Ok(None),
            None => println!("Please answer l, r, b or s."),
        }
    }
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Decider for the configured policy
pub fn decider_for(policy: ConflictPolicy) -> Arc<dyn ConflictDecider> {
    match policy.resolution() {
        Some(resolution) => Arc::new(FixedPolicy(resolution)),
        None => Arc::new(PromptDecider::new()),
    }
}

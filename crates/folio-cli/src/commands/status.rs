//! Status command handler

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use folio_core::{Config, ConflictPolicy};

use crate::output::{Output, OutputFormat};

#[derive(Debug, Serialize)]
struct Status<'a> {
    config_file: String,
    library_root: String,
    library_exists: bool,
    server_url: Option<&'a str>,
    sync_enabled: bool,
    conflict_policy: ConflictPolicy,
    /// Set when sync cannot start with this configuration
    problem: Option<String>,
}

impl Status<'_> {
    fn ready(&self) -> bool {
        self.sync_enabled && self.problem.is_none()
    }
}

fn status<'a>(config: &'a Config, config_path: Option<&Path>) -> Status<'a> {
    let config_file = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path);

    Status {
        config_file: config_file.display().to_string(),
        library_root: config.library_root.display().to_string(),
        library_exists: config.library_root.is_dir(),
        server_url: config.server_url.as_deref(),
        sync_enabled: config.sync_enabled,
        conflict_policy: config.conflict_policy,
        problem: config.sync_settings().err().map(|e| e.to_string()),
    }
}

/// Show configuration and sync readiness
pub fn show(config: &Config, config_path: Option<&Path>, output: &Output) -> Result<()> {
    let status = status(config, config_path);

    match output.format {
        OutputFormat::Json => {
            let mut value = serde_json::to_value(&status)?;
            value["ready"] = serde_json::Value::Bool(status.ready());
            println!("{}", value);
        }
        OutputFormat::Quiet => {
            println!("{}", if status.ready() { "ready" } else { "not ready" });
        }
        OutputFormat::Human => {
            println!("Folio Status");
            println!("============");
            println!();
            println!("Library:");
            if status.library_root.is_empty() {
                println!("  Root:   (not set)");
            } else {
                println!(
                    "  Root:   {}{}",
                    status.library_root,
                    if status.library_exists {
                        ""
                    } else {
                        " (will be created)"
                    }
                );
            }
            println!();
            println!("Sync:");
            println!(
                "  Status: {}",
                if status.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!("  Server: {}", status.server_url.unwrap_or("(not set)"));
            println!("  Conflicts: {:?}", status.conflict_policy);
            if let Some(ref problem) = status.problem {
                println!("  Problem: {}", problem);
            }
            println!();
            println!("Config file: {}", status.config_file);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_needs_enabled_and_valid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let mut config = Config {
            library_root: dir.path().join("library"),
            server_url: Some("https://example.com".into()),
            ..Config::default()
        };

        let current = status(&config, Some(&config_path));
        assert!(!current.ready());
        assert!(current.problem.is_none());
        assert!(!current.library_exists);
        assert_eq!(current.config_file, config_path.display().to_string());

        config.sync_enabled = true;
        assert!(status(&config, Some(&config_path)).ready());

        config.server_url = Some("ftp://example.com".into());
        let current = status(&config, Some(&config_path));
        assert!(!current.ready());
        assert!(current.problem.is_some());
    }
}

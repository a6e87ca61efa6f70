//! Config command handlers

use std::path::Path;

use anyhow::{bail, Context, Result};

use folio_core::Config;

use crate::output::{Output, OutputFormat};

/// Keys accepted by `config set`
const VALID_KEYS: &[&str] = &[
    "library_root",
    "server_url",
    "api_token",
    "sync_enabled",
    "conflict_policy",
    "timestamp_tolerance_secs",
    "max_reconnect_attempts",
    "transfer_workers",
    "metadata_failure_policy",
    "conflict_timeout_secs",
    "log_file",
];

fn not_set(value: Option<String>) -> String {
    value.unwrap_or_else(|| "(not set)".to_string())
}

fn effective_path(config_path: Option<&Path>) -> std::path::PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path)
}

/// Show current configuration
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    let api_token = config.api_token.as_ref().map(|_| "********".to_string());

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "library_root": config.library_root,
                    "server_url": config.server_url,
                    "api_token": api_token,
                    "sync_enabled": config.sync_enabled,
                    "conflict_policy": config.conflict_policy,
                    "timestamp_tolerance_secs": config.timestamp_tolerance_secs,
                    "max_reconnect_attempts": config.max_reconnect_attempts,
                    "transfer_workers": config.transfer_workers,
                    "metadata_failure_policy": config.metadata_failure_policy,
                    "conflict_timeout_secs": config.conflict_timeout_secs,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.library_root.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!(
                "  library_root:             {}",
                not_set(
                    Some(config.library_root.display().to_string()).filter(|s| !s.is_empty())
                )
            );
            println!("  server_url:               {}", not_set(config.server_url));
            println!("  api_token:                {}", not_set(api_token));
            println!("  sync_enabled:             {}", config.sync_enabled);
            println!("  conflict_policy:          {:?}", config.conflict_policy);
            println!(
                "  timestamp_tolerance_secs: {}",
                config.timestamp_tolerance_secs
            );
            println!(
                "  max_reconnect_attempts:   {}",
                config.max_reconnect_attempts
            );
            println!("  transfer_workers:         {}", config.transfer_workers);
            println!(
                "  metadata_failure_policy:  {:?}",
                config.metadata_failure_policy
            );
            println!("  conflict_timeout_secs:    {}", config.conflict_timeout_secs);
            println!(
                "  log_file:                 {}",
                not_set(config.log_file.map(|p| p.display().to_string()))
            );
            println!();
            println!("Config file: {}", effective_path(config_path).display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: &str, value: &str, config_path: Option<&Path>, output: &Output) -> Result<()> {
    if !VALID_KEYS.contains(&key) {
        bail!(
            "Unknown configuration key: '{}'\nValid keys: {}",
            key,
            VALID_KEYS.join(", ")
        );
    }

    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    config.set(key, value)?;

    // Save to the CLI-specified path or default
    config
        .save_to_path(&effective_path(config_path))
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_writes_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        set("server_url", "https://library.example", Some(&path), &output).unwrap();
        set("conflict_policy", "keep_both", Some(&path), &output).unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(
            config.server_url.as_deref(),
            Some("https://library.example")
        );
        assert_eq!(config.conflict_policy, folio_core::ConflictPolicy::KeepBoth);
    }

    #[test]
    fn test_set_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        let err = set("favorite_tag", "x", Some(&path), &output).unwrap_err();
        assert!(err.to_string().contains("Valid keys"));

        assert!(set("transfer_workers", "0", Some(&path), &output).is_err());
        assert!(set("conflict_policy", "newest", Some(&path), &output).is_err());
        assert!(!path.exists());
    }
}

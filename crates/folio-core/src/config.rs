//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/folio/config.toml)
//! 3. Environment variables (FOLIO_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::conflict::Resolution;
use crate::error::{SyncError, SyncResult};

/// Environment variable prefix
const ENV_PREFIX: &str = "FOLIO";

/// How conflicts are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Ask interactively
    #[default]
    Prompt,
    KeepLocal,
    KeepRemote,
    KeepBoth,
}

impl ConflictPolicy {
    /// The fixed resolution for this policy, `None` for `Prompt`
    pub fn resolution(self) -> Option<Resolution> {
        match self {
            ConflictPolicy::Prompt => None,
            ConflictPolicy::KeepLocal => Some(Resolution::KeepLocal),
            ConflictPolicy::KeepRemote => Some(Resolution::KeepRemote),
            ConflictPolicy::KeepBoth => Some(Resolution::KeepBoth),
        }
    }
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "prompt" => Ok(ConflictPolicy::Prompt),
            "keep_local" => Ok(ConflictPolicy::KeepLocal),
            "keep_remote" => Ok(ConflictPolicy::KeepRemote),
            "keep_both" => Ok(ConflictPolicy::KeepBoth),
            other => Err(format!(
                "unknown conflict policy '{}' (expected prompt, keep_local, keep_remote or keep_both)",
                other
            )),
        }
    }
}

/// What to do with a changed local file when its remote metadata cannot be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataFailurePolicy {
    /// Upload anyway
    #[default]
    Upload,
    /// Leave it for the next reconciliation pass
    Skip,
}

impl std::str::FromStr for MetadataFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "upload" => Ok(MetadataFailurePolicy::Upload),
            "skip" => Ok(MetadataFailurePolicy::Skip),
            other => Err(format!(
                "unknown metadata failure policy '{}' (expected upload or skip)",
                other
            )),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local directory kept in sync; empty means sync does not start
    #[serde(default)]
    pub library_root: PathBuf,

    /// Library server base URL
    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default)]
    pub sync_enabled: bool,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Modification times closer than this are treated as a conflict
    #[serde(default = "default_timestamp_tolerance_secs")]
    pub timestamp_tolerance_secs: u64,

    /// Consecutive failed connection attempts before giving up (0 = never)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Concurrent transfers during a reconciliation pass
    #[serde(default = "default_transfer_workers")]
    pub transfer_workers: usize,

    #[serde(default)]
    pub metadata_failure_policy: MetadataFailurePolicy,

    /// How long a conflict waits for a decision
    #[serde(default = "default_conflict_timeout_secs")]
    pub conflict_timeout_secs: u64,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_timestamp_tolerance_secs() -> u64 {
    2
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_transfer_workers() -> usize {
    4
}

fn default_conflict_timeout_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library_root: PathBuf::new(),
            server_url: None,
            api_token: None,
            sync_enabled: false,
            conflict_policy: ConflictPolicy::default(),
            timestamp_tolerance_secs: default_timestamp_tolerance_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            transfer_workers: default_transfer_workers(),
            metadata_failure_policy: MetadataFailurePolicy::default(),
            conflict_timeout_secs: default_conflict_timeout_secs(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (FOLIO_LIBRARY_ROOT, FOLIO_SERVER_URL, ...)
    /// 2. Config file (~/.config/folio/config.toml or FOLIO_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from `--config` when given, otherwise from the default location
    pub fn load_with_cli_override(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_LIBRARY_ROOT", ENV_PREFIX)) {
            self.library_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SERVER_URL", ENV_PREFIX)) {
            self.server_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_API_TOKEN", ENV_PREFIX)) {
            self.api_token = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Set a single key from its string form
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |v: &str| {
            if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            }
        };

        match key {
            "library_root" => self.library_root = PathBuf::from(value),
            "server_url" => self.server_url = optional(value),
            "api_token" => self.api_token = optional(value),
            "sync_enabled" => {
                self.sync_enabled = value
                    .parse()
                    .with_context(|| format!("Invalid boolean for {}: {}", key, value))?
            }
            "conflict_policy" => {
                self.conflict_policy = value.parse().map_err(anyhow::Error::msg)?
            }
            "timestamp_tolerance_secs" => {
                self.timestamp_tolerance_secs = value
                    .parse()
                    .with_context(|| format!("Invalid number for {}: {}", key, value))?
            }
            "max_reconnect_attempts" => {
                self.max_reconnect_attempts = value
                    .parse()
                    .with_context(|| format!("Invalid number for {}: {}", key, value))?
            }
            "transfer_workers" => {
                let workers: usize = value
                    .parse()
                    .with_context(|| format!("Invalid number for {}: {}", key, value))?;
                anyhow::ensure!(workers > 0, "transfer_workers must be at least 1");
                self.transfer_workers = workers;
            }
            "metadata_failure_policy" => {
                self.metadata_failure_policy = value.parse().map_err(anyhow::Error::msg)?
            }
            "conflict_timeout_secs" => {
                self.conflict_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid number for {}: {}", key, value))?
            }
            "log_file" => self.log_file = optional(value).map(PathBuf::from),
            other => anyhow::bail!("Unknown config key: {}", other),
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with FOLIO_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("folio")
            .join("config.toml")
    }

    /// Engine settings, or `NotConfigured` if sync cannot start
    pub fn sync_settings(&self) -> SyncResult<SyncSettings> {
        if self.library_root.as_os_str().is_empty() {
            return Err(SyncError::NotConfigured("library_root is empty".to_string()));
        }
        let server_url = match self.server_url.as_deref() {
            Some(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
            _ => return Err(SyncError::NotConfigured("server_url is not set".to_string())),
        };
        if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
            return Err(SyncError::NotConfigured(format!(
                "server_url must start with http:// or https://: {}",
                server_url
            )));
        }

        let mut settings = SyncSettings::new(&self.library_root, server_url);
        settings.api_token = self.api_token.clone();
        settings.timestamp_tolerance = Duration::from_secs(self.timestamp_tolerance_secs);
        settings.max_reconnect_attempts = self.max_reconnect_attempts;
        settings.transfer_workers = self.transfer_workers.max(1);
        settings.metadata_failure_policy = self.metadata_failure_policy;
        settings.conflict_timeout = Duration::from_secs(self.conflict_timeout_secs);
        Ok(settings)
    }
}

/// Everything a coordinator needs for one library root
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub library_root: PathBuf,
    pub server_url: String,
    pub api_token: Option<String>,
    pub timestamp_tolerance: Duration,
    pub transfer_workers: usize,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub conflict_timeout: Duration,
    pub metadata_failure_policy: MetadataFailurePolicy,
    pub watcher_debounce: Duration,
    /// How long after the engine's own write a path stays suppressed
    pub suppression_grace: Duration,
    pub reconcile_retry_delay: Duration,
    pub request_timeout: Duration,
}

impl SyncSettings {
    pub fn new(library_root: impl Into<PathBuf>, server_url: impl Into<String>) -> Self {
        Self {
            library_root: library_root.into(),
            server_url: server_url.into(),
            api_token: None,
            timestamp_tolerance: Duration::from_secs(default_timestamp_tolerance_secs()),
            transfer_workers: default_transfer_workers(),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            conflict_timeout: Duration::from_secs(default_conflict_timeout_secs()),
            metadata_failure_policy: MetadataFailurePolicy::default(),
            watcher_debounce: Duration::from_millis(250),
            suppression_grace: Duration::from_secs(2),
            reconcile_retry_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "FOLIO_LIBRARY_ROOT",
        "FOLIO_SERVER_URL",
        "FOLIO_API_TOKEN",
        "FOLIO_SYNC_ENABLED",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.sync_enabled);
        assert!(config.server_url.is_none());
        assert_eq!(config.timestamp_tolerance_secs, 2);
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.conflict_policy, ConflictPolicy::Prompt);
        assert_eq!(config.metadata_failure_policy, MetadataFailurePolicy::Upload);
    }

    #[test]
    fn test_env_overrides() {
        let _guard = EnvGuard::new(ENV_VARS);
        let mut config = Config::default();

        env::set_var("FOLIO_LIBRARY_ROOT", "/tmp/library");
        env::set_var("FOLIO_SERVER_URL", "https://folio.example.com");
        env::set_var("FOLIO_API_TOKEN", "secret");
        env::set_var("FOLIO_SYNC_ENABLED", "1");
        config.apply_env_overrides();

        assert_eq!(config.library_root, PathBuf::from("/tmp/library"));
        assert_eq!(config.server_url.as_deref(), Some("https://folio.example.com"));
        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert!(config.sync_enabled);

        // Empty string clears it
        env::set_var("FOLIO_SERVER_URL", "");
        env::set_var("FOLIO_SYNC_ENABLED", "false");
        config.apply_env_overrides();
        assert!(config.server_url.is_none());
        assert!(!config.sync_enabled);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            library_root = "/home/me/library"
            server_url = "http://localhost:5000"
            conflict_policy = "keep_both"
            metadata_failure_policy = "skip"
            timestamp_tolerance_secs = 5
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.library_root, PathBuf::from("/home/me/library"));
        assert_eq!(config.conflict_policy, ConflictPolicy::KeepBoth);
        assert_eq!(config.metadata_failure_policy, MetadataFailurePolicy::Skip);
        assert_eq!(config.timestamp_tolerance_secs, 5);
        assert_eq!(config.transfer_workers, 4);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config::load_from_path(Path::new("/nonexistent/config.toml")).unwrap();
        assert!(!config.sync_enabled);
        assert!(config.library_root.as_os_str().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set("library_root", "/data/library").unwrap();
        config.set("server_url", "https://sync.example.com").unwrap();
        config.set("conflict_policy", "keep_remote").unwrap();
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.library_root, PathBuf::from("/data/library"));
        assert_eq!(loaded.server_url.as_deref(), Some("https://sync.example.com"));
        assert_eq!(loaded.conflict_policy, ConflictPolicy::KeepRemote);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("conflict_policy", "coin_flip").is_err());
        assert!(config.set("transfer_workers", "0").is_err());
        assert!(config.set("timestamp_tolerance_secs", "soon").is_err());
        assert!(config.set("no_such_key", "1").is_err());
    }

    #[test]
    fn test_sync_settings_requires_root_and_server() {
        let mut config = Config::default();
        let err = config.sync_settings().unwrap_err();
        assert!(matches!(err, SyncError::NotConfigured(_)));

        config.library_root = PathBuf::from("/data/library");
        assert!(matches!(
            config.sync_settings().unwrap_err(),
            SyncError::NotConfigured(_)
        ));

        config.server_url = Some("ftp://nope".to_string());
        assert!(config.sync_settings().is_err());

        config.server_url = Some("https://sync.example.com/".to_string());
        config.timestamp_tolerance_secs = 7;
        let settings = config.sync_settings().unwrap();
        assert_eq!(settings.server_url, "https://sync.example.com");
        assert_eq!(settings.timestamp_tolerance, Duration::from_secs(7));
        assert_eq!(settings.max_reconnect_attempts, 10);
    }
}

//! Configuration for the recorder and sync engine.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VOXSYNC_HOME, VOXSYNC_DRIVE_TOKEN)
//! 2. Config file (.voxsync/config.yaml)
//! 3. Defaults (~/.voxsync)
//!
//! Config file discovery:
//! - Searches current directory and parents for .voxsync/config.yaml
//! - Relative paths in the config file resolve against the .voxsync/ directory

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub capture: Option<CaptureConfig>,
    #[serde(default)]
    pub sync: Option<SyncConfig>,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .voxsync/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    pub flush_interval_seconds: Option<u64>,
    pub mime_type: Option<String>,
    pub folder_template: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub interval_seconds: Option<u64>,
    pub max_retry_count: Option<u32>,
    pub upload_timeout_seconds: Option<u64>,
    pub backoff: Option<BackoffMode>,
    pub base_delay_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub kind: Option<RemoteKind>,
    pub root_folder: Option<String>,
    /// Target directory for the `directory` remote (relative to .voxsync/)
    pub directory: Option<String>,
    pub token_lifetime_seconds: Option<u64>,
    pub probe_host: Option<String>,
}

/// How failed uploads are spaced out between passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    /// Retry on every pass (fixed polling interval)
    Fixed,
    /// Exponential delay with jitter, capped at the sync interval
    Exponential,
}

/// Which remote store uploads go to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    Drive,
    Directory,
}

/// Capture settings
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub flush_interval: Duration,
    pub mime_type: String,
    pub folder_template: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            mime_type: "audio/webm".to_string(),
            folder_template: "%Y/%m-%B".to_string(),
        }
    }
}

/// Sync queue settings
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    pub max_retry_count: u32,
    pub upload_timeout: Duration,
    pub backoff: BackoffMode,
    pub base_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_retry_count: 5,
            upload_timeout: Duration::from_secs(600),
            backoff: BackoffMode::Exponential,
            base_delay: Duration::from_secs(5),
        }
    }
}

/// Remote store settings
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub kind: RemoteKind,
    pub root_folder: String,
    pub directory: Option<PathBuf>,
    pub token_lifetime: Duration,
    /// Bearer token for the Drive remote (from VOXSYNC_DRIVE_TOKEN)
    pub access_token: Option<String>,
    pub probe_host: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            kind: RemoteKind::Drive,
            root_folder: "Voice Recordings".to_string(),
            directory: None,
            token_lifetime: Duration::from_secs(3600),
            access_token: None,
            probe_host: "www.googleapis.com:443".to_string(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to engine state (chunks, catalog, settings)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub capture: CaptureSettings,
    pub sync: SyncSettings,
    pub remote: RemoteSettings,
}

impl ResolvedConfig {
    /// Configuration rooted at `home` with default settings
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            home,
            config_file: None,
            capture: CaptureSettings::default(),
            sync: SyncSettings::default(),
            remote: RemoteSettings::default(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".voxsync").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Overlay file settings on top of defaults
fn apply_file(resolved: &mut ResolvedConfig, config: ConfigFile, config_dir: &Path) {
    if let Some(capture) = config.capture {
        let defaults = &mut resolved.capture;
        if let Some(secs) = capture.flush_interval_seconds {
            defaults.flush_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(mime) = capture.mime_type {
            defaults.mime_type = mime;
        }
        if let Some(template) = capture.folder_template {
            defaults.folder_template = template;
        }
    }

    if let Some(sync) = config.sync {
        let defaults = &mut resolved.sync;
        if let Some(secs) = sync.interval_seconds {
            defaults.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(max) = sync.max_retry_count {
            defaults.max_retry_count = max;
        }
        if let Some(secs) = sync.upload_timeout_seconds {
            defaults.upload_timeout = Duration::from_secs(secs);
        }
        if let Some(mode) = sync.backoff {
            defaults.backoff = mode;
        }
        if let Some(secs) = sync.base_delay_seconds {
            defaults.base_delay = Duration::from_secs(secs);
        }
    }

    if let Some(remote) = config.remote {
        let defaults = &mut resolved.remote;
        if let Some(kind) = remote.kind {
            defaults.kind = kind;
        }
        if let Some(root) = remote.root_folder {
            defaults.root_folder = root;
        }
        if let Some(dir) = remote.directory {
            defaults.directory = Some(resolve_path(config_dir, &dir));
        }
        if let Some(secs) = remote.token_lifetime_seconds {
            defaults.token_lifetime = Duration::from_secs(secs);
        }
        if let Some(host) = remote.probe_host {
            defaults.probe_host = host;
        }
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".voxsync");

    // Check for config file
    let config_file = find_config_file();

    let mut resolved = ResolvedConfig::with_home(default_home);

    if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;
        let config_dir = config_path.parent().unwrap_or(Path::new("."));

        if let Some(ref home_path) = config.paths.home {
            resolved.home = resolve_path(config_dir, home_path);
        }
        apply_file(&mut resolved, config, config_dir);
    }

    if let Ok(env_home) = std::env::var("VOXSYNC_HOME") {
        resolved.home = PathBuf::from(env_home);
    }
    if let Ok(token) = std::env::var("VOXSYNC_DRIVE_TOKEN") {
        if !token.trim().is_empty() {
            resolved.remote.access_token = Some(token.trim().to_string());
        }
    }
    if resolved.remote.directory.is_none() {
        resolved.remote.directory = Some(resolved.home.join("outbox"));
    }

    resolved.config_file = config_file;
    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ResolvedConfig::with_home(PathBuf::from("/tmp/voxsync"));

        assert_eq!(config.capture.flush_interval, Duration::from_secs(30));
        assert_eq!(config.sync.interval, Duration::from_secs(30));
        assert_eq!(config.sync.max_retry_count, 5);
        assert_eq!(config.sync.backoff, BackoffMode::Exponential);
        assert_eq!(config.remote.kind, RemoteKind::Drive);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let voxsync_dir = temp.path().join(".voxsync");
        std::fs::create_dir_all(&voxsync_dir).unwrap();

        let config_path = voxsync_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
capture:
  flush_interval_seconds: 10
  mime_type: audio/ogg
sync:
  max_retry_count: 3
  backoff: fixed
remote:
  kind: directory
  directory: ../outbox
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./state".to_string()));

        let mut resolved = ResolvedConfig::with_home(PathBuf::from("/unused"));
        apply_file(&mut resolved, config, &voxsync_dir);

        assert_eq!(resolved.capture.flush_interval, Duration::from_secs(10));
        assert_eq!(resolved.capture.mime_type, "audio/ogg");
        assert_eq!(resolved.sync.max_retry_count, 3);
        assert_eq!(resolved.sync.backoff, BackoffMode::Fixed);
        assert_eq!(resolved.remote.kind, RemoteKind::Directory);
        assert!(resolved.remote.directory.unwrap().ends_with("outbox"));
        // Untouched sections keep defaults
        assert_eq!(resolved.sync.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config: ConfigFile = serde_yaml::from_str(
            r#"
version: "1.0"
capture:
  flush_interval_seconds: 0
sync:
  interval_seconds: 0
"#,
        )
        .unwrap();

        let mut resolved = ResolvedConfig::with_home(PathBuf::from("/unused"));
        apply_file(&mut resolved, config, Path::new("/"));

        assert_eq!(resolved.capture.flush_interval, Duration::from_secs(1));
        assert_eq!(resolved.sync.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.voxsync");

        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "./state"),
            PathBuf::from("/home/user/project/.voxsync/./state")
        );
    }
}

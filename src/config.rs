//! Application configuration with persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mpv::{default_ipc_path, Backoff, MpvOptions};

const APP_DIR: &str = "termtune";
const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "queue.db";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Failed to read config: {0}")]
  Io(#[from] std::io::Error),

  #[error("Malformed config: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("Invalid config: {0}")]
  Invalid(String),

  #[error("No config directory on this platform")]
  NoConfigDir,
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
  /// Custom MPV executable path (None = auto-detect).
  pub mpv_path: Option<String>,

  /// Additional MPV command-line arguments.
  pub mpv_args: Vec<String>,

  /// Spawn MPV, or attach to one already listening on `ipc_path`.
  pub spawn_mpv: bool,

  /// IPC socket or pipe (None = per-process default).
  pub ipc_path: Option<String>,

  pub connect_attempts: u32,
  pub connect_base_delay_ms: u64,
  pub connect_max_delay_ms: u64,
  pub command_timeout_ms: u64,

  /// Queue database (None = platform data directory).
  pub database_path: Option<String>,

  /// Profile whose saved queue may be restored.
  pub profile_id: String,

  pub provider_id: String,

  /// Volume applied after MPV starts, 0-100.
  pub initial_volume: u32,

  /// off, error, warn, info, debug or trace.
  pub log_level: String,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      mpv_path: None,
      mpv_args: Vec::new(),
      spawn_mpv: true,
      ipc_path: None,
      connect_attempts: 10,
      connect_base_delay_ms: 100,
      connect_max_delay_ms: 2000,
      command_timeout_ms: 5000,
      database_path: None,
      profile_id: "default".to_string(),
      provider_id: "local".to_string(),
      initial_volume: 100,
      log_level: "info".to_string(),
    }
  }
}

impl AppConfig {
  /// `<config_dir>/termtune/config.json`
  pub fn default_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
      .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
      .ok_or(ConfigError::NoConfigDir)
  }

  /// Load from `path`. A missing file yields defaults.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = match std::fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        log::info!("Config file not found, using defaults. path={}", path.display());
        return Ok(Self::default());
      }
      Err(e) => return Err(e.into()),
    };
    let config: Self = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
  }

  pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(self)?)?;
    Ok(())
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.connect_attempts == 0 {
      return Err(ConfigError::Invalid("connectAttempts must be at least 1".to_string()));
    }
    if self.connect_base_delay_ms > self.connect_max_delay_ms {
      return Err(ConfigError::Invalid(
        "connectBaseDelayMs cannot exceed connectMaxDelayMs".to_string(),
      ));
    }
    if self.command_timeout_ms == 0 {
      return Err(ConfigError::Invalid("commandTimeoutMs must be positive".to_string()));
    }
    if self.profile_id.trim().is_empty() {
      return Err(ConfigError::Invalid("profileId cannot be empty".to_string()));
    }
    if self.initial_volume > 100 {
      return Err(ConfigError::Invalid("initialVolume must be between 0 and 100".to_string()));
    }
    Ok(())
  }

  pub fn log_level(&self) -> LevelFilter {
    self.log_level.parse().unwrap_or(LevelFilter::Info)
  }

  pub fn database_path(&self) -> Option<PathBuf> {
    match self.database_path.as_deref().filter(|s| !s.is_empty()) {
      Some(path) => Some(PathBuf::from(path)),
      None => dirs::data_dir().map(|dir| dir.join(APP_DIR).join(DATABASE_FILE)),
    }
  }

  pub fn mpv_options(&self) -> MpvOptions {
    MpvOptions {
      mpv_path: self
        .mpv_path
        .as_ref()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from),
      extra_args: self.mpv_args.clone(),
      spawn: self.spawn_mpv,
      ipc_path: self
        .ipc_path
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(default_ipc_path),
      backoff: Backoff {
        attempts: self.connect_attempts,
        base: Duration::from_millis(self.connect_base_delay_ms),
        max: Duration::from_millis(self.connect_max_delay_ms),
      },
      command_timeout: Duration::from_millis(self.command_timeout_ms),
      ..MpvOptions::default()
    }
  }
}

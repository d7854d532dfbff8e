//! Where tracks come from and how they are streamed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::track::Track;

#[derive(Debug, Error)]
pub enum ProviderError {
  #[error("Track not found: {0}")]
  NotFound(String),

  #[error("Provider unavailable: {0}")]
  Unavailable(String),
}

/// A resolved stream: what the player opens, and the HTTP headers to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSource {
  pub url: String,
  pub headers: BTreeMap<String, String>,
}

impl StreamSource {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      headers: BTreeMap::new(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }
}

/// A music library.
#[allow(async_fn_in_trait)]
pub trait Provider {
  /// Identifier stored alongside persisted queues.
  fn id(&self) -> &str;

  /// Resolve a track id to something the player can open.
  async fn stream(&self, track_id: &str) -> Result<StreamSource, ProviderError>;
}

/// Plain files on the local filesystem. Track ids are absolute paths.
#[derive(Debug, Clone, Default)]
pub struct LocalProvider;

impl LocalProvider {
  pub const ID: &'static str = "local";

  /// Build a track for a file. The title is the file stem.
  pub fn track_for(path: &Path) -> Track {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let title = path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| path.display().to_string());
    let mut track = Track::new(path.display().to_string(), title);
    track.codec = path
      .extension()
      .map(|e| e.to_string_lossy().to_ascii_lowercase());
    track
  }
}

impl Provider for LocalProvider {
  fn id(&self) -> &str {
    Self::ID
  }

  async fn stream(&self, track_id: &str) -> Result<StreamSource, ProviderError> {
    let path = PathBuf::from(track_id);
    match tokio::fs::metadata(&path).await {
      Ok(meta) if meta.is_file() => Ok(StreamSource::new(path.display().to_string())),
      Ok(_) => Err(ProviderError::NotFound(format!("{} is not a file", path.display()))),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        Err(ProviderError::NotFound(path.display().to_string()))
      }
      Err(e) => Err(ProviderError::Unavailable(format!("{}: {}", path.display(), e))),
    }
  }
}

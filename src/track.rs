//! Track value type shared by the queue, persistence and providers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A playable track as described by its provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
  /// Provider-scoped identifier, passed back to the provider to resolve a stream.
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub artist: String,
  #[serde(default)]
  pub album: String,
  #[serde(default)]
  pub duration: Duration,
  /// Codec hint, e.g. "flac".
  #[serde(default)]
  pub codec: Option<String>,
  /// Bitrate hint in kbit/s.
  #[serde(default)]
  pub bitrate: Option<u32>,
  /// Provider-specific stream reference (path, item id, URL).
  #[serde(default)]
  pub stream_ref: String,
}

impl Track {
  /// Minimal track; remaining metadata defaults to empty.
  pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
    let id = id.into();
    Self {
      stream_ref: id.clone(),
      id,
      title: title.into(),
      artist: String::new(),
      album: String::new(),
      duration: Duration::ZERO,
      codec: None,
      bitrate: None,
    }
  }

  /// "Artist - Title", or just the title when the artist is unknown.
  pub fn display_name(&self) -> String {
    if self.artist.is_empty() {
      self.title.clone()
    } else {
      format!("{} - {}", self.artist, self.title)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_json_uses_camel_case_and_tolerates_missing_hints() {
    let track: Track = serde_json::from_str(r#"{"id":"42","title":"Song","streamRef":"/m/42.flac"}"#).unwrap();
    assert_eq!(track.stream_ref, "/m/42.flac");
    assert_eq!(track.codec, None);
    assert_eq!(track.duration, Duration::ZERO);
  }

  #[test]
  fn test_display_name() {
    let mut track = Track::new("1", "Song");
    assert_eq!(track.display_name(), "Song");
    track.artist = "Band".into();
    assert_eq!(track.display_name(), "Band - Song");
  }
}

//! Normalized playback events.
//!
//! Raw mpv notifications are folded into [`PlayerEvent`], where every field is
//! optional: a field that is `None` was not reported by this notification and
//! must be treated as unchanged, never as zero.

use serde::Deserialize;
use serde_json::Value;

use super::protocol::MpvEvent;

/// Why mpv stopped playing a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
  /// Playback reached the end of the media.
  Eof,
  /// Playback was stopped or replaced by another file.
  Stop,
  /// The player is shutting down.
  Quit,
  /// The file could not be played.
  Error,
  /// The file was a playlist or redirect and was expanded.
  Redirect,
  /// A reason this version does not know about.
  #[serde(other)]
  Unknown,
}

impl EndReason {
  fn parse(reason: &str) -> Self {
    serde_json::from_value(Value::String(reason.to_owned())).unwrap_or(EndReason::Unknown)
  }
}

/// A single normalized notification from the player.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerEvent {
  /// Playback position in seconds.
  pub position: Option<f64>,
  /// Duration of the current file in seconds.
  pub duration: Option<f64>,
  pub paused: Option<bool>,
  /// Volume, 0-100.
  pub volume: Option<f64>,
  pub muted: Option<bool>,
  /// True only when the current track finished naturally.
  pub ended: bool,
  /// Reason reported with an end-file notification, for diagnostics.
  pub end_reason: Option<EndReason>,
  /// Protocol or playback error text.
  pub error: Option<String>,
}

impl PlayerEvent {
  /// Event carrying a decode failure for a single protocol line.
  pub fn decode_error(message: impl Into<String>) -> Self {
    Self {
      error: Some(message.into()),
      ..Default::default()
    }
  }

  /// Normalize a raw mpv event.
  ///
  /// Returns `None` for notifications that carry nothing the engine tracks:
  /// unobserved properties, null property data, and unrelated event types.
  pub fn from_mpv(event: &MpvEvent) -> Option<Self> {
    match event.event.as_str() {
      "property-change" => Self::from_property(event.name.as_deref()?, event.data.as_ref()?),
      "end-file" => {
        let reason = event.reason.as_deref().map(EndReason::parse).unwrap_or(EndReason::Unknown);
        let error = match reason {
          EndReason::Error => Some(
            event
              .file_error
              .clone()
              .unwrap_or_else(|| "playback error".to_string()),
          ),
          _ => None,
        };
        Some(Self {
          ended: reason == EndReason::Eof,
          end_reason: Some(reason),
          error,
          ..Default::default()
        })
      }
      _ => None,
    }
  }

  fn from_property(name: &str, data: &Value) -> Option<Self> {
    let mut event = Self::default();
    match name {
      "time-pos" => event.position = Some(data.as_f64()?),
      "duration" => event.duration = Some(data.as_f64()?),
      "pause" => event.paused = Some(data.as_bool()?),
      "volume" => event.volume = Some(data.as_f64()?),
      "mute" => event.muted = Some(data.as_bool()?),
      _ => return None,
    }
    Some(event)
  }

  /// Whether the consumer should advance to the next track.
  pub fn is_natural_end(&self) -> bool {
    self.ended
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mpv::protocol::MpvMessage;

  fn normalize(line: &str) -> Option<PlayerEvent> {
    match MpvMessage::parse(line).unwrap() {
      MpvMessage::Event(e) => PlayerEvent::from_mpv(&e),
      MpvMessage::Response(_) => panic!("Expected event"),
    }
  }

  #[test]
  fn test_property_change_populates_only_matching_field() {
    let event = normalize(r#"{"event":"property-change","id":1,"name":"time-pos","data":12.5}"#).unwrap();
    assert_eq!(event.position, Some(12.5));
    assert_eq!(event.duration, None);
    assert_eq!(event.paused, None);
    assert_eq!(event.volume, None);
    assert_eq!(event.muted, None);
    assert!(!event.ended);
  }

  #[test]
  fn test_zero_is_distinct_from_absent() {
    let event = normalize(r#"{"event":"property-change","name":"volume","data":0}"#).unwrap();
    assert_eq!(event.volume, Some(0.0));
    let event = normalize(r#"{"event":"property-change","name":"mute","data":false}"#).unwrap();
    assert_eq!(event.muted, Some(false));
  }

  #[test]
  fn test_null_data_is_dropped() {
    assert_eq!(normalize(r#"{"event":"property-change","name":"time-pos","data":null}"#), None);
    assert_eq!(normalize(r#"{"event":"property-change","name":"time-pos"}"#), None);
    assert_eq!(normalize(r#"{"event":"property-change","name":"pause","data":"yes"}"#), None);
  }

  #[test]
  fn test_unobserved_property_is_dropped() {
    assert_eq!(normalize(r#"{"event":"property-change","name":"media-title","data":"x"}"#), None);
    assert_eq!(normalize(r#"{"event":"start-file"}"#), None);
  }

  #[test]
  fn test_only_eof_is_a_natural_end() {
    let eof = normalize(r#"{"event":"end-file","reason":"eof"}"#).unwrap();
    assert!(eof.is_natural_end());
    assert_eq!(eof.end_reason, Some(EndReason::Eof));

    for (reason, expected) in [
      ("stop", EndReason::Stop),
      ("quit", EndReason::Quit),
      ("error", EndReason::Error),
      ("redirect", EndReason::Redirect),
      ("something-new", EndReason::Unknown),
    ] {
      let line = format!(r#"{{"event":"end-file","reason":"{}"}}"#, reason);
      let event = normalize(&line).unwrap();
      assert!(!event.ended, "{} must not advance", reason);
      assert_eq!(event.end_reason, Some(expected));
    }
  }

  #[test]
  fn test_error_end_carries_file_error() {
    let event =
      normalize(r#"{"event":"end-file","reason":"error","file_error":"loading failed"}"#).unwrap();
    assert_eq!(event.error.as_deref(), Some("loading failed"));
    assert!(!event.ended);
  }
}

//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

/// Global request ID counter for unique command identification.
static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Generate a unique request ID for MPV commands.
pub fn next_request_id() -> i64 {
  REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Properties observed for the lifetime of a session, keyed by observer ID.
pub const OBSERVED_PROPERTIES: [(i64, &str); 5] = [
  (1, "time-pos"),
  (2, "duration"),
  (3, "pause"),
  (4, "volume"),
  (5, "mute"),
];

/// Property used to override HTTP request headers for the next load.
pub const HEADER_FIELDS_PROPERTY: &str = "http-header-fields";

/// Command sent to MPV via IPC.
#[derive(Debug, Clone, Serialize)]
pub struct MpvCommand {
  pub command: Vec<Value>,
  pub request_id: i64,
}

impl MpvCommand {
  /// Create a new command with auto-generated request ID.
  pub fn new(args: Vec<Value>) -> Self {
    Self {
      command: args,
      request_id: next_request_id(),
    }
  }

  /// Load a file, replacing whatever is currently playing.
  pub fn loadfile_replace(url: &str) -> Self {
    Self::new(vec!["loadfile".into(), url.into(), "replace".into()])
  }

  /// Seek relative to the current position, in seconds.
  pub fn seek_relative(delta: f64) -> Self {
    Self::new(vec!["seek".into(), delta.into(), "relative".into()])
  }

  /// Set an arbitrary property.
  pub fn set_property(name: &str, value: Value) -> Self {
    Self::new(vec!["set_property".into(), name.into(), value])
  }

  /// Observe a property for changes.
  pub fn observe_property(id: i64, name: &str) -> Self {
    Self::new(vec!["observe_property".into(), id.into(), name.into()])
  }

  /// Quit MPV.
  pub fn quit() -> Self {
    Self::new(vec!["quit".into()])
  }

  /// Serialize as a single protocol line, newline included.
  pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(self)?;
    line.push(b'\n');
    Ok(line)
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success" or error message.
  pub error: String,
  /// Matching request ID.
  pub request_id: i64,
}

impl MpvResponse {
  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Event sent by MPV (property changes, playback events, etc.).
#[derive(Debug, Clone, Deserialize)]
pub struct MpvEvent {
  /// Event type (e.g., "property-change", "end-file").
  pub event: String,
  /// Observer ID for property-change events.
  #[serde(default)]
  pub id: Option<i64>,
  /// Property name for property-change events.
  #[serde(default)]
  pub name: Option<String>,
  /// Event data.
  #[serde(default)]
  pub data: Option<Value>,
  /// Reason for end-file events (e.g., "eof", "stop", "quit", "error").
  #[serde(default)]
  pub reason: Option<String>,
  /// Error text attached to end-file events with reason "error".
  #[serde(default)]
  pub file_error: Option<String>,
}

/// Message received from MPV IPC (either response or event).
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
}

impl MpvMessage {
  /// Parse a JSON line from MPV.
  ///
  /// The line is decoded once and dispatched on its top-level keys, so a
  /// `request_id` appearing inside a string value cannot misroute it.
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    if value.get("request_id").is_some_and(|id| !id.is_null()) && value.get("event").is_none() {
      Ok(MpvMessage::Response(serde_json::from_value(value)?))
    } else {
      Ok(MpvMessage::Event(serde_json::from_value(value)?))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_loadfile_replace_serialization() {
    let cmd = MpvCommand::loadfile_replace("http://example.com/song.flac");
    let json: Value = serde_json::from_slice(&cmd.to_line().unwrap()).unwrap();
    assert_eq!(
      json["command"],
      serde_json::json!(["loadfile", "http://example.com/song.flac", "replace"])
    );
    assert_eq!(json["request_id"], cmd.request_id);
  }

  #[test]
  fn test_line_is_newline_terminated() {
    let line = MpvCommand::quit().to_line().unwrap();
    assert_eq!(line.last(), Some(&b'\n'));
    assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
  }

  #[test]
  fn test_request_ids_are_unique() {
    let a = MpvCommand::quit();
    let b = MpvCommand::quit();
    assert_ne!(a.request_id, b.request_id);
  }

  #[test]
  fn test_response_parsing() {
    let json = r#"{"error":"success","data":null,"request_id":1}"#;
    match MpvMessage::parse(json).unwrap() {
      MpvMessage::Response(r) => {
        assert!(r.is_success());
        assert_eq!(r.request_id, 1);
      }
      _ => panic!("Expected response"),
    }

    // Reply payloads are ignored; only the status and id matter.
    let json = r#"{"error":"property unavailable","data":{"x":[1,2]},"request_id":2}"#;
    match MpvMessage::parse(json).unwrap() {
      MpvMessage::Response(r) => {
        assert!(!r.is_success());
        assert_eq!(r.request_id, 2);
      }
      _ => panic!("Expected response"),
    }
  }

  #[test]
  fn test_event_parsing() {
    let json = r#"{"event":"property-change","id":3,"name":"pause","data":false}"#;
    match MpvMessage::parse(json).unwrap() {
      MpvMessage::Event(e) => {
        assert_eq!(e.event, "property-change");
        assert_eq!(e.name.as_deref(), Some("pause"));
      }
      _ => panic!("Expected event"),
    }
  }

  #[test]
  fn test_request_id_inside_string_is_not_a_response() {
    let json = r#"{"event":"property-change","name":"media-title","data":"request_id"}"#;
    assert!(matches!(MpvMessage::parse(json).unwrap(), MpvMessage::Event(_)));
  }

  #[test]
  fn test_garbage_is_an_error() {
    assert!(MpvMessage::parse("not json").is_err());
    assert!(MpvMessage::parse(r#"{"data":1}"#).is_err());
  }
}

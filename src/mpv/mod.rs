//! MPV IPC module - spawns and controls external MPV player via JSON IPC.
//!
//! Architecture:
//! - `process.rs` - MPV binary detection and process spawning
//! - `reconnect.rs` - Bounded exponential backoff with jitter for dialing
//! - `ipc.rs` - Async IPC connection (Named Pipes on Windows, Unix Sockets on Linux/macOS)
//! - `protocol.rs` - JSON command/response types and serialization
//! - `event.rs` - Normalized playback events
//! - `client.rs` - High-level MPV client with lifecycle and command methods

mod client;
mod event;
mod ipc;
mod process;
mod protocol;
mod reconnect;

pub use client::{clamp_volume, redact_url, MpvClient, MpvError, MpvOptions, SessionState};
pub use event::{EndReason, PlayerEvent};
pub use ipc::IpcError;
pub use process::{default_ipc_path, find_mpv, ProcessError};
pub use reconnect::Backoff;

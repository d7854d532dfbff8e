//! Playback engine for a terminal music player.
//!
//! mpv does the decoding and output; this crate drives it over JSON IPC,
//! keeps the play queue, and persists the queue between runs.

pub mod config;
pub mod mpv;
pub mod player;
pub mod provider;
pub mod queue;
pub mod store;
pub mod track;

pub use config::{AppConfig, ConfigError};
pub use mpv::{MpvClient, MpvError, MpvOptions, PlayerEvent};
pub use player::{EventOutcome, PlaybackStatus, Player, PlayerError, Transport};
pub use provider::{LocalProvider, Provider, ProviderError, StreamSource};
pub use queue::{Queue, QueueError, RepeatMode};
pub use store::{PersistHandle, QueueSnapshot, QueueStore, StoreError};
pub use track::Track;

//! Orchestrator tying the queue, the provider, persistence and mpv together.
//!
//! Everything here runs on one task: events are handled one at a time, each
//! queue mutation is followed by a best-effort save, and only a natural end
//! of file moves playback forward.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::mpv::{redact_url, MpvClient, MpvError, PlayerEvent};
use crate::provider::{Provider, ProviderError};
use crate::queue::{Queue, QueueError, RepeatMode};
use crate::store::{PersistHandle, QueueSnapshot};
use crate::track::Track;

#[derive(Debug, Error)]
pub enum PlayerError {
  #[error(transparent)]
  Queue(#[from] QueueError),

  #[error("Failed to resolve stream: {0}")]
  Provider(#[from] ProviderError),

  #[error("Player command failed: {0}")]
  Transport(#[from] MpvError),
}

/// The commands the orchestrator needs from a playback backend.
#[allow(async_fn_in_trait)]
pub trait Transport {
  async fn play(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<(), MpvError>;
  async fn toggle_pause(&self, paused: bool) -> Result<(), MpvError>;
  async fn seek(&self, delta_seconds: f64) -> Result<(), MpvError>;
  async fn set_volume(&self, volume: f64) -> Result<(), MpvError>;
  async fn set_mute(&self, muted: bool) -> Result<(), MpvError>;
}

impl Transport for MpvClient {
  async fn play(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<(), MpvError> {
    MpvClient::play(self, url, headers).await
  }

  async fn toggle_pause(&self, paused: bool) -> Result<(), MpvError> {
    MpvClient::toggle_pause(self, paused).await
  }

  async fn seek(&self, delta_seconds: f64) -> Result<(), MpvError> {
    MpvClient::seek(self, delta_seconds).await
  }

  async fn set_volume(&self, volume: f64) -> Result<(), MpvError> {
    MpvClient::set_volume(self, volume).await
  }

  async fn set_mute(&self, muted: bool) -> Result<(), MpvError> {
    MpvClient::set_mute(self, muted).await
  }
}

/// Last known playback state, built from events.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStatus {
  pub position: f64,
  pub duration: Option<f64>,
  pub paused: bool,
  pub volume: f64,
  pub muted: bool,
  /// The current file reached its end.
  pub ended: bool,
  pub last_error: Option<String>,
}

impl Default for PlaybackStatus {
  fn default() -> Self {
    Self {
      position: 0.0,
      duration: None,
      paused: false,
      volume: 100.0,
      muted: false,
      ended: false,
      last_error: None,
    }
  }
}

impl PlaybackStatus {
  /// Apply the fields present in `event`; absent fields are unchanged.
  pub fn apply(&mut self, event: &PlayerEvent) {
    if let Some(position) = event.position {
      self.position = position;
    }
    if let Some(duration) = event.duration {
      self.duration = Some(duration);
    }
    if let Some(paused) = event.paused {
      self.paused = paused;
    }
    if let Some(volume) = event.volume {
      self.volume = volume;
    }
    if let Some(muted) = event.muted {
      self.muted = muted;
    }
    if event.ended {
      self.ended = true;
    }
    if let Some(error) = &event.error {
      self.last_error = Some(error.clone());
    }
  }

  fn reset_track(&mut self) {
    self.position = 0.0;
    self.duration = None;
    self.ended = false;
  }
}

/// What handling an event led to.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
  /// Status updated, playback unchanged.
  Updated,
  /// The track ended and the next one started.
  Advanced(Track),
  /// The track ended and there is nothing left to play.
  Finished,
}

pub struct Player<T, P> {
  transport: T,
  provider: P,
  queue: Queue,
  status: PlaybackStatus,
  persist: Option<PersistHandle>,
  profile_id: String,
}

impl<T: Transport, P: Provider> Player<T, P> {
  pub fn new(transport: T, provider: P, profile_id: impl Into<String>) -> Self {
    Self {
      transport,
      provider,
      queue: Queue::new(),
      status: PlaybackStatus::default(),
      persist: None,
      profile_id: profile_id.into(),
    }
  }

  pub fn with_queue(mut self, queue: Queue) -> Self {
    self.queue = queue;
    self
  }

  /// Save the queue through `persist` after every mutation.
  pub fn with_persistence(mut self, persist: PersistHandle) -> Self {
    self.persist = Some(persist);
    self
  }

  pub fn queue(&self) -> &Queue {
    &self.queue
  }

  pub fn status(&self) -> &PlaybackStatus {
    &self.status
  }

  pub fn transport(&self) -> &T {
    &self.transport
  }

  pub fn profile_id(&self) -> &str {
    &self.profile_id
  }

  /// Replace the queue with a stored snapshot.
  ///
  /// Returns false, leaving the queue alone, when the snapshot belongs to a
  /// different profile or provider.
  pub fn restore(&mut self, snapshot: QueueSnapshot) -> bool {
    if !snapshot.belongs_to(&self.profile_id) {
      log::info!(
        "Ignoring saved queue for profile {:?}, active profile is {}",
        snapshot.profile_id,
        self.profile_id
      );
      return false;
    }
    if let Some(provider_id) = snapshot.provider_id.as_deref() {
      if provider_id != self.provider.id() {
        log::info!(
          "Ignoring saved queue from provider {}, active provider is {}",
          provider_id,
          self.provider.id()
        );
        return false;
      }
    }

    self.queue = snapshot.into_queue();
    log::info!(
      "Restored queue: {} tracks, current {:?}, shuffle {}, repeat {}",
      self.queue.len(),
      self.queue.current_index(),
      self.queue.is_shuffled(),
      self.queue.repeat_mode()
    );
    true
  }

  /// Fold one event into the status and auto-advance on a natural end.
  pub async fn handle_event(&mut self, event: PlayerEvent) -> Result<EventOutcome, PlayerError> {
    self.status.apply(&event);

    if let Some(error) = &event.error {
      log::warn!("Playback error: {}", error);
    }

    if !event.is_natural_end() {
      if let Some(reason) = event.end_reason {
        log::info!("Playback ended ({:?}), not advancing", reason);
      }
      return Ok(EventOutcome::Updated);
    }

    log::info!("Playback ended naturally, advancing queue");
    self.advance().await
  }

  /// Move to the next playable track. Tracks whose stream cannot be
  /// resolved are skipped.
  async fn advance(&mut self) -> Result<EventOutcome, PlayerError> {
    for _ in 0..self.queue.len() {
      let track = match self.queue.next() {
        Ok(track) => track,
        Err(QueueError::EndOfQueue) | Err(QueueError::Empty) => {
          log::info!("End of queue reached");
          return Ok(EventOutcome::Finished);
        }
        Err(e) => return Err(e.into()),
      };
      self.persist();

      match self.play_track(&track).await {
        Ok(()) => return Ok(EventOutcome::Advanced(track)),
        Err(PlayerError::Provider(e)) => {
          log::warn!("Skipping {}: {}", track.display_name(), e);
        }
        Err(e) => return Err(e),
      }
    }
    Ok(EventOutcome::Finished)
  }

  async fn play_track(&mut self, track: &Track) -> Result<(), PlayerError> {
    let source = self.provider.stream(&track.id).await?;
    log::info!("Playing {} ({})", track.display_name(), redact_url(&source.url));
    self.transport.play(&source.url, &source.headers).await?;
    self.status.reset_track();
    Ok(())
  }

  /// Start the current track.
  pub async fn play_current(&mut self) -> Result<Track, PlayerError> {
    let track = self.queue.current().ok_or(QueueError::Empty)?;
    self.play_track(&track).await?;
    Ok(track)
  }

  pub async fn next(&mut self) -> Result<Track, PlayerError> {
    let track = self.queue.next()?;
    self.persist();
    self.play_track(&track).await?;
    Ok(track)
  }

  pub async fn prev(&mut self) -> Result<Track, PlayerError> {
    let track = self.queue.prev()?;
    self.persist();
    self.play_track(&track).await?;
    Ok(track)
  }

  /// Jump to `index` and play it.
  pub async fn select(&mut self, index: usize) -> Result<Track, PlayerError> {
    let track = self.queue.set_current(index)?;
    self.persist();
    self.play_track(&track).await?;
    Ok(track)
  }

  pub fn enqueue(&mut self, tracks: impl IntoIterator<Item = Track>) -> Result<(), PlayerError> {
    self.queue.add(tracks)?;
    self.persist();
    Ok(())
  }

  pub fn enqueue_next(&mut self, track: Track) -> Result<(), PlayerError> {
    self.queue.add_next(track)?;
    self.persist();
    Ok(())
  }

  /// Remove a track from the queue. Whatever is playing keeps playing.
  pub fn remove(&mut self, index: usize) -> Result<Track, PlayerError> {
    let track = self.queue.remove(index)?;
    self.persist();
    Ok(track)
  }

  pub fn move_track(&mut self, from: usize, to: usize) -> Result<(), PlayerError> {
    self.queue.move_track(from, to)?;
    self.persist();
    Ok(())
  }

  pub fn toggle_shuffle(&mut self) -> bool {
    let shuffled = self.queue.toggle_shuffle();
    self.persist();
    shuffled
  }

  pub fn cycle_repeat(&mut self) -> RepeatMode {
    let mode = self.queue.cycle_repeat();
    self.persist();
    mode
  }

  pub fn set_repeat(&mut self, mode: RepeatMode) {
    self.queue.set_repeat(mode);
    self.persist();
  }

  pub fn clear(&mut self) {
    self.queue.clear();
    self.persist();
  }

  pub async fn toggle_pause(&mut self) -> Result<(), PlayerError> {
    self.transport.toggle_pause(!self.status.paused).await?;
    Ok(())
  }

  pub async fn seek(&mut self, delta_seconds: f64) -> Result<(), PlayerError> {
    self.transport.seek(delta_seconds).await?;
    Ok(())
  }

  pub async fn set_volume(&mut self, volume: f64) -> Result<(), PlayerError> {
    self.transport.set_volume(volume).await?;
    Ok(())
  }

  pub async fn set_mute(&mut self, muted: bool) -> Result<(), PlayerError> {
    self.transport.set_mute(muted).await?;
    Ok(())
  }

  /// Delete the stored queue, including its owner. The in-memory queue is
  /// untouched and the next mutation saves it again.
  pub fn discard_saved(&self) {
    if let Some(persist) = &self.persist {
      persist.clear();
    }
  }

  /// Wait for pending saves to reach disk.
  pub fn flush(&self) {
    if let Some(persist) = &self.persist {
      if !persist.flush() {
        log::warn!("Queue persistence unavailable, latest changes may be lost");
      }
    }
  }

  fn persist(&self) {
    if let Some(persist) = &self.persist {
      persist.save(QueueSnapshot::capture(
        &self.queue,
        self.provider.id(),
        &self.profile_id,
      ));
    }
  }
}

//! Playback queue.
//!
//! An ordered list of tracks in play order with a cursor on the current
//! track, a shuffle flag and a repeat mode. The cursor follows track identity:
//! moving entries or toggling shuffle keeps it on the same logical track.
//!
//! Every entry carries a queue-local key so the same track may be queued
//! more than once without the copies being confused.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::track::Track;

/// Largest number of tracks a queue will hold.
pub const MAX_QUEUE_LEN: usize = 10_000;

/// What `next` does at the end of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
  /// Stop at the ends.
  #[default]
  Off,
  /// Wrap around.
  All,
  /// Repeat the current track.
  One,
}

impl RepeatMode {
  /// Off → All → One → Off.
  pub fn cycle(self) -> Self {
    match self {
      RepeatMode::Off => RepeatMode::All,
      RepeatMode::All => RepeatMode::One,
      RepeatMode::One => RepeatMode::Off,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      RepeatMode::Off => "off",
      RepeatMode::All => "all",
      RepeatMode::One => "one",
    }
  }
}

impl fmt::Display for RepeatMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for RepeatMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "off" => Ok(RepeatMode::Off),
      "all" => Ok(RepeatMode::All),
      "one" => Ok(RepeatMode::One),
      other => Err(format!("unknown repeat mode: {}", other)),
    }
  }
}

/// Queue boundary conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
  #[error("Queue is empty")]
  Empty,
  #[error("Already at the end of the queue")]
  EndOfQueue,
  #[error("Already at the start of the queue")]
  StartOfQueue,
  #[error("Index {index} out of range for queue of {len}")]
  IndexOutOfRange { index: usize, len: usize },
  #[error("Queue is full ({len} of {MAX_QUEUE_LEN}), cannot add {adding}")]
  Full { len: usize, adding: usize },
}

#[derive(Debug, Clone)]
struct Entry {
  key: u64,
  track: Track,
}

/// Ordered tracks with a cursor, shuffle and repeat.
#[derive(Debug, Clone)]
pub struct Queue {
  /// Entries in play order.
  entries: Vec<Entry>,
  /// Keys in sequential order; only kept while shuffled.
  sequence: Option<Vec<u64>>,
  cursor: Option<usize>,
  repeat: RepeatMode,
  next_key: u64,
  rng: StdRng,
}

impl Default for Queue {
  fn default() -> Self {
    Self::new()
  }
}

impl Queue {
  /// Create new empty queue
  pub fn new() -> Self {
    Self::with_rng(StdRng::from_entropy())
  }

  /// Empty queue with a deterministic shuffle.
  pub fn with_seed(seed: u64) -> Self {
    Self::with_rng(StdRng::seed_from_u64(seed))
  }

  fn with_rng(rng: StdRng) -> Self {
    Self {
      entries: Vec::new(),
      sequence: None,
      cursor: None,
      repeat: RepeatMode::Off,
      next_key: 0,
      rng,
    }
  }

  /// Rebuild a queue from persisted parts.
  ///
  /// `tracks` are in play order. `sequence_ranks`, when shuffled, gives each
  /// track's rank in sequential order; ranks may have gaps. The cursor is
  /// clamped into range, so a stale index never points past the end.
  pub fn from_parts(
    mut tracks: Vec<Track>,
    sequence_ranks: Option<Vec<i64>>,
    cursor: i64,
    shuffled: bool,
    repeat: RepeatMode,
  ) -> Self {
    if tracks.len() > MAX_QUEUE_LEN {
      log::warn!("Restored queue has {} tracks, keeping {}", tracks.len(), MAX_QUEUE_LEN);
      tracks.truncate(MAX_QUEUE_LEN);
    }

    let mut queue = Self::new();
    queue.repeat = repeat;
    let entries: Vec<Entry> = tracks.into_iter().map(|track| queue.entry(track)).collect();
    queue.entries = entries;
    queue.cursor = clamp_cursor(cursor, queue.entries.len());

    if shuffled {
      let keys: Vec<u64> = queue.entries.iter().map(|e| e.key).collect();
      let sequence = match sequence_ranks {
        Some(ranks) if ranks.len() >= keys.len() => {
          let mut ranked: Vec<(i64, u64)> = ranks.into_iter().zip(keys).collect();
          ranked.sort_by_key(|(rank, _)| *rank);
          ranked.into_iter().map(|(_, key)| key).collect()
        }
        _ => keys,
      };
      queue.sequence = Some(sequence);
    }
    queue
  }

  fn entry(&mut self, track: Track) -> Entry {
    let key = self.next_key;
    self.next_key += 1;
    Entry { key, track }
  }

  fn ensure_room(&self, adding: usize) -> Result<(), QueueError> {
    if self.entries.len() + adding > MAX_QUEUE_LEN {
      return Err(QueueError::Full {
        len: self.entries.len(),
        adding,
      });
    }
    Ok(())
  }

  fn check_index(&self, index: usize) -> Result<(), QueueError> {
    if index >= self.entries.len() {
      return Err(QueueError::IndexOutOfRange {
        index,
        len: self.entries.len(),
      });
    }
    Ok(())
  }

  /// Append tracks. On an empty queue the first new track becomes current.
  pub fn add(&mut self, tracks: impl IntoIterator<Item = Track>) -> Result<(), QueueError> {
    let tracks: Vec<Track> = tracks.into_iter().collect();
    self.ensure_room(tracks.len())?;
    if tracks.is_empty() {
      return Ok(());
    }

    let was_empty = self.entries.is_empty();
    for track in tracks {
      let entry = self.entry(track);
      if let Some(sequence) = self.sequence.as_mut() {
        sequence.push(entry.key);
      }
      self.entries.push(entry);
    }
    if was_empty {
      self.cursor = Some(0);
    }
    Ok(())
  }

  /// Insert a track right after the current one.
  pub fn add_next(&mut self, track: Track) -> Result<(), QueueError> {
    self.ensure_room(1)?;
    let entry = self.entry(track);
    let key = entry.key;

    let Some(cursor) = self.cursor else {
      self.entries.push(entry);
      if let Some(sequence) = self.sequence.as_mut() {
        sequence.push(key);
      }
      self.cursor = Some(0);
      return Ok(());
    };

    let current_key = self.entries[cursor].key;
    self.entries.insert(cursor + 1, entry);
    if let Some(sequence) = self.sequence.as_mut() {
      let at = sequence
        .iter()
        .position(|k| *k == current_key)
        .map_or(sequence.len(), |p| p + 1);
      sequence.insert(at, key);
    }
    Ok(())
  }

  /// Remove the track at `index`.
  pub fn remove(&mut self, index: usize) -> Result<Track, QueueError> {
    self.check_index(index)?;
    let removed = self.entries.remove(index);
    if let Some(sequence) = self.sequence.as_mut() {
      sequence.retain(|k| *k != removed.key);
    }

    let len = self.entries.len();
    self.cursor = match self.cursor {
      _ if len == 0 => None,
      Some(c) if index < c => Some(c - 1),
      Some(c) if c >= len => Some(len - 1),
      other => other,
    };
    Ok(removed.track)
  }

  /// Move the track at `from` to `to`, keeping the cursor on the same track.
  pub fn move_track(&mut self, from: usize, to: usize) -> Result<(), QueueError> {
    self.check_index(from)?;
    self.check_index(to)?;
    if from == to {
      return Ok(());
    }

    let entry = self.entries.remove(from);
    self.entries.insert(to, entry);

    if let Some(c) = self.cursor {
      self.cursor = Some(if c == from {
        to
      } else if from < c && c <= to {
        c - 1
      } else if to <= c && c < from {
        c + 1
      } else {
        c
      });
    }

    // Unshuffled, play order is the sequential order, so nothing else to fix.
    Ok(())
  }

  /// Advance according to the repeat mode and return the new current track.
  pub fn next(&mut self) -> Result<Track, QueueError> {
    let cursor = self.cursor.ok_or(QueueError::Empty)?;
    let target = match self.repeat {
      RepeatMode::One => cursor,
      _ if cursor + 1 < self.entries.len() => cursor + 1,
      RepeatMode::All => 0,
      RepeatMode::Off => return Err(QueueError::EndOfQueue),
    };
    self.cursor = Some(target);
    Ok(self.entries[target].track.clone())
  }

  /// Step back according to the repeat mode and return the new current track.
  pub fn prev(&mut self) -> Result<Track, QueueError> {
    let cursor = self.cursor.ok_or(QueueError::Empty)?;
    let target = match self.repeat {
      RepeatMode::One => cursor,
      _ if cursor > 0 => cursor - 1,
      RepeatMode::All => self.entries.len() - 1,
      RepeatMode::Off => return Err(QueueError::StartOfQueue),
    };
    self.cursor = Some(target);
    Ok(self.entries[target].track.clone())
  }

  /// What `next` would return, without moving the cursor.
  pub fn peek_next(&self) -> Option<Track> {
    let cursor = self.cursor?;
    let target = match self.repeat {
      RepeatMode::One => cursor,
      _ if cursor + 1 < self.entries.len() => cursor + 1,
      RepeatMode::All => 0,
      RepeatMode::Off => return None,
    };
    Some(self.entries[target].track.clone())
  }

  /// Jump to `index`.
  pub fn set_current(&mut self, index: usize) -> Result<Track, QueueError> {
    self.check_index(index)?;
    self.cursor = Some(index);
    Ok(self.entries[index].track.clone())
  }

  /// Switch between sequential and shuffled order. Returns the new state.
  ///
  /// Shuffling puts the current track first and randomizes the rest after
  /// it; unshuffling restores sequential order. The current track stays
  /// current either way.
  pub fn toggle_shuffle(&mut self) -> bool {
    let current_key = self.cursor.map(|c| self.entries[c].key);

    match self.sequence.take() {
      None => {
        self.sequence = Some(self.entries.iter().map(|e| e.key).collect());
        let head = self.cursor.map(|c| self.entries.remove(c));
        self.entries.shuffle(&mut self.rng);
        if let Some(head) = head {
          self.entries.insert(0, head);
        }
      }
      Some(sequence) => {
        let mut by_key: std::collections::HashMap<u64, Entry> =
          self.entries.drain(..).map(|e| (e.key, e)).collect();
        self.entries = sequence.iter().filter_map(|k| by_key.remove(k)).collect();
        // Anything missing from the sequence keeps its relative order at the end.
        let mut rest: Vec<Entry> = by_key.into_values().collect();
        rest.sort_by_key(|e| e.key);
        self.entries.extend(rest);
      }
    }

    self.cursor = current_key.and_then(|key| self.entries.iter().position(|e| e.key == key));
    self.sequence.is_some()
  }

  /// Off → All → One → Off. Returns the new mode.
  pub fn cycle_repeat(&mut self) -> RepeatMode {
    self.repeat = self.repeat.cycle();
    self.repeat
  }

  pub fn set_repeat(&mut self, mode: RepeatMode) {
    self.repeat = mode;
  }

  /// Remove every track. Shuffle and repeat settings are kept.
  pub fn clear(&mut self) {
    self.entries.clear();
    if let Some(sequence) = self.sequence.as_mut() {
      sequence.clear();
    }
    self.cursor = None;
  }

  /// Copies of all tracks in play order.
  pub fn items(&self) -> Vec<Track> {
    self.entries.iter().map(|e| e.track.clone()).collect()
  }

  pub fn current(&self) -> Option<Track> {
    self.cursor.map(|c| self.entries[c].track.clone())
  }

  pub fn current_index(&self) -> Option<usize> {
    self.cursor
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn is_shuffled(&self) -> bool {
    self.sequence.is_some()
  }

  pub fn repeat_mode(&self) -> RepeatMode {
    self.repeat
  }

  /// For each track in play order, its position in sequential order.
  pub fn sequence_positions(&self) -> Vec<usize> {
    match &self.sequence {
      None => (0..self.entries.len()).collect(),
      Some(sequence) => {
        let rank: std::collections::HashMap<u64, usize> =
          sequence.iter().enumerate().map(|(i, k)| (*k, i)).collect();
        self
          .entries
          .iter()
          .map(|e| rank.get(&e.key).copied().unwrap_or(usize::MAX))
          .collect()
      }
    }
  }
}

/// Clamp a persisted cursor into `[-1, len - 1]`, as `None` for -1.
fn clamp_cursor(cursor: i64, len: usize) -> Option<usize> {
  if len == 0 {
    return None;
  }
  let max = len - 1;
  Some(usize::try_from(cursor).map_or(0, |c| c.min(max)))
}

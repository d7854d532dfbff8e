//! Durable queue snapshots.
//!
//! The queue is stored in SQLite as one row per track plus a singleton state
//! row. The in-memory [`Queue`] is authoritative; the stored copy is a best
//! effort snapshot used to restore the queue on the next start.
//!
//! # Tables
//!
//! * `queue_items` - Tracks in play order, with their sequential position.
//! * `queue_state` - Exactly one row: cursor, shuffle, repeat and owner.

mod worker;

pub use worker::PersistHandle;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::queue::{Queue, RepeatMode};
use crate::track::Track;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("Database error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("Track encoding error: {0}")]
  Json(#[from] serde_json::Error),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// Everything needed to rebuild a [`Queue`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
  /// Tracks in play order.
  pub tracks: Vec<Track>,
  /// Sequential rank of each track, parallel to `tracks`.
  pub sequence_ranks: Vec<i64>,
  /// Cursor, -1 when empty.
  pub current_index: i64,
  pub shuffled: bool,
  pub repeat: RepeatMode,
  pub profile_id: Option<String>,
  pub provider_id: Option<String>,
}

impl Default for QueueSnapshot {
  fn default() -> Self {
    Self {
      tracks: Vec::new(),
      sequence_ranks: Vec::new(),
      current_index: -1,
      shuffled: false,
      repeat: RepeatMode::Off,
      profile_id: None,
      provider_id: None,
    }
  }
}

impl QueueSnapshot {
  /// Capture the state of `queue` on behalf of a provider and profile.
  pub fn capture(queue: &Queue, provider_id: &str, profile_id: &str) -> Self {
    Self {
      tracks: queue.items(),
      sequence_ranks: queue
        .sequence_positions()
        .into_iter()
        .map(|p| i64::try_from(p).unwrap_or(i64::MAX))
        .collect(),
      current_index: queue
        .current_index()
        .and_then(|c| i64::try_from(c).ok())
        .unwrap_or(-1),
      shuffled: queue.is_shuffled(),
      repeat: queue.repeat_mode(),
      profile_id: Some(profile_id.to_string()),
      provider_id: Some(provider_id.to_string()),
    }
  }

  /// Whether this snapshot was saved by `profile_id`.
  pub fn belongs_to(&self, profile_id: &str) -> bool {
    self.profile_id.as_deref() == Some(profile_id)
  }

  pub fn into_queue(self) -> Queue {
    Queue::from_parts(
      self.tracks,
      Some(self.sequence_ranks),
      self.current_index,
      self.shuffled,
      self.repeat,
    )
  }
}

/// SQLite-backed queue persistence.
pub struct QueueStore {
  conn: Connection,
}

impl QueueStore {
  /// Open (creating if needed) the database at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }
    let conn = Connection::open(path)?;

    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    if journal_mode != "wal" {
      log::warn!("SQLite WAL mode unavailable, using {}", journal_mode);
    }
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;

    Self::init(conn)
  }

  /// In-memory store, for tests and throwaway sessions.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::init(Connection::open_in_memory()?)
  }

  fn init(conn: Connection) -> Result<Self, StoreError> {
    create_schema(&conn)?;
    Ok(Self { conn })
  }

  /// Replace the stored snapshot with the state of `queue`.
  pub fn save(&mut self, queue: &Queue, provider_id: &str, profile_id: &str) -> Result<(), StoreError> {
    self.save_snapshot(&QueueSnapshot::capture(queue, provider_id, profile_id))
  }

  /// Replace all rows and the state row in one transaction.
  pub fn save_snapshot(&mut self, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
    let added_at = unix_now();
    let provider_id = snapshot.provider_id.as_deref().unwrap_or_default();

    let tx = self.conn.transaction()?;
    tx.execute("DELETE FROM queue_items", [])?;
    {
      let mut insert = tx.prepare_cached(
        "INSERT INTO queue_items (position, track_id, provider_id, track_json, sequence_position, added_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      )?;
      for (position, track) in snapshot.tracks.iter().enumerate() {
        let rank = snapshot.sequence_ranks.get(position).copied();
        insert.execute(params![
          position as i64,
          track.id,
          provider_id,
          serde_json::to_string(track)?,
          rank,
          added_at,
        ])?;
      }
    }
    let updated = tx.execute(
      "UPDATE queue_state
       SET current_index = ?1, shuffle_enabled = ?2, repeat_mode = ?3, profile_id = ?4, provider_id = ?5
       WHERE id = 1",
      params![
        snapshot.current_index,
        snapshot.shuffled,
        snapshot.repeat.as_str(),
        snapshot.profile_id,
        snapshot.provider_id,
      ],
    )?;
    if updated != 1 {
      // Dropping the transaction rolls back the item rows too.
      return Err(rusqlite::Error::StatementChangedRows(updated).into());
    }
    tx.commit()?;

    log::debug!("Saved queue snapshot with {} tracks", snapshot.tracks.len());
    Ok(())
  }

  /// Read the stored snapshot.
  ///
  /// Rows that cannot be decoded are skipped, and the cursor is clamped to
  /// the tracks that survived.
  pub fn load(&self) -> Result<QueueSnapshot, StoreError> {
    let mut snapshot = QueueSnapshot::default();

    let mut stmt = self.conn.prepare_cached(
      "SELECT position, track_json, sequence_position FROM queue_items ORDER BY position",
    )?;
    let rows = stmt.query_map([], |row| {
      Ok((
        row.get::<_, i64>(0)?,
        row.get::<_, String>(1),
        row.get::<_, Option<i64>>(2).ok().flatten(),
      ))
    })?;

    // Positions of dropped rows, to keep the cursor on the same track.
    let mut skipped = Vec::new();
    for row in rows {
      let (position, json, rank) = match row {
        Ok(row) => row,
        Err(e) => {
          log::warn!("Skipping unreadable queue row: {}", e);
          continue;
        }
      };
      let track = json
        .map_err(StoreError::from)
        .and_then(|json| Ok(serde_json::from_str::<Track>(&json)?));
      match track {
        Ok(track) => {
          snapshot.tracks.push(track);
          snapshot.sequence_ranks.push(rank.unwrap_or(position));
        }
        Err(e) => {
          log::warn!("Skipping corrupt queue row at position {}: {}", position, e);
          skipped.push(position);
        }
      }
    }

    let state = self
      .conn
      .query_row(
        "SELECT current_index, shuffle_enabled, repeat_mode, profile_id, provider_id
         FROM queue_state WHERE id = 1",
        [],
        |row| {
          Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, bool>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
          ))
        },
      )
      .optional()?;

    if let Some((current_index, shuffled, repeat, profile_id, provider_id)) = state {
      snapshot.current_index = current_index;
      snapshot.shuffled = shuffled;
      snapshot.repeat = repeat.parse().unwrap_or_else(|e| {
        log::warn!("{}, using off", e);
        RepeatMode::Off
      });
      snapshot.profile_id = profile_id;
      snapshot.provider_id = provider_id;
    }

    // A corrupt cursor row resolves to the track after it.
    let shift = skipped.iter().filter(|&&p| p < snapshot.current_index).count() as i64;
    snapshot.current_index = clamp_index(snapshot.current_index - shift, snapshot.tracks.len());
    Ok(snapshot)
  }

  /// Delete all rows and reset the state row to defaults.
  pub fn clear(&mut self) -> Result<(), StoreError> {
    let tx = self.conn.transaction()?;
    tx.execute("DELETE FROM queue_items", [])?;
    tx.execute(
      "UPDATE queue_state
       SET current_index = -1, shuffle_enabled = 0, repeat_mode = 'off', profile_id = NULL, provider_id = NULL
       WHERE id = 1",
      [],
    )?;
    tx.commit()?;
    Ok(())
  }

  #[cfg(test)]
  fn connection(&self) -> &Connection {
    &self.conn
  }
}

/// Create the schema and the singleton state row.
fn create_schema(conn: &Connection) -> Result<(), StoreError> {
  conn.execute_batch(
    "BEGIN;

    CREATE TABLE IF NOT EXISTS queue_items (
        position INTEGER PRIMARY KEY,
        track_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        track_json TEXT NOT NULL,
        sequence_position INTEGER,
        added_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS queue_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        current_index INTEGER NOT NULL DEFAULT -1,
        shuffle_enabled INTEGER NOT NULL DEFAULT 0,
        repeat_mode TEXT NOT NULL DEFAULT 'off',
        profile_id TEXT,
        provider_id TEXT
    );

    INSERT OR IGNORE INTO queue_state (id) VALUES (1);

    COMMIT;",
  )?;
  Ok(())
}

fn clamp_index(index: i64, len: usize) -> i64 {
  if len == 0 {
    return -1;
  }
  index.clamp(0, len as i64 - 1)
}

fn unix_now() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs() as i64)
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tracks(n: usize) -> Vec<Track> {
    (0..n)
      .map(|i| {
        let mut t = Track::new(format!("t{}", i), format!("Track {}", i));
        t.artist = "Artist".into();
        t.duration = std::time::Duration::from_secs(180 + i as u64);
        t.codec = Some("flac".into());
        t
      })
      .collect()
  }

  fn queue_with(n: usize, cursor: Option<usize>) -> Queue {
    let mut queue = Queue::with_seed(3);
    queue.add(tracks(n)).unwrap();
    if let Some(c) = cursor {
      queue.set_current(c).unwrap();
    }
    queue
  }

  fn round_trip(queue: &Queue) -> Queue {
    let mut store = QueueStore::open_in_memory().unwrap();
    store.save(queue, "local", "me").unwrap();
    let snapshot = store.load().unwrap();
    assert!(snapshot.belongs_to("me"));
    assert_eq!(snapshot.provider_id.as_deref(), Some("local"));
    snapshot.into_queue()
  }

  #[test]
  fn test_round_trip_sizes_and_boundaries() {
    let cases = [
      queue_with(0, None),
      queue_with(1, Some(0)),
      queue_with(5, Some(0)),
      queue_with(5, Some(4)),
    ];
    for mut queue in cases {
      queue.set_repeat(RepeatMode::All);
      let restored = round_trip(&queue);
      assert_eq!(restored.items(), queue.items());
      assert_eq!(restored.current_index(), queue.current_index());
      assert_eq!(restored.is_shuffled(), queue.is_shuffled());
      assert_eq!(restored.repeat_mode(), RepeatMode::All);
    }
  }

  #[test]
  fn test_round_trip_shuffled_keeps_sequential_order() {
    let mut queue = queue_with(8, Some(5));
    queue.toggle_shuffle();
    queue.set_repeat(RepeatMode::One);

    let mut restored = round_trip(&queue);
    assert!(restored.is_shuffled());
    assert_eq!(restored.items(), queue.items());
    assert_eq!(restored.current().unwrap().id, "t5");

    restored.toggle_shuffle();
    queue.toggle_shuffle();
    assert_eq!(restored.items(), queue.items());
  }

  #[test]
  fn test_save_replaces_previous_rows() {
    let mut store = QueueStore::open_in_memory().unwrap();
    store.save(&queue_with(5, Some(3)), "local", "me").unwrap();
    store.save(&queue_with(2, Some(1)), "local", "me").unwrap();
    let snapshot = store.load().unwrap();
    assert_eq!(snapshot.tracks.len(), 2);
    assert_eq!(snapshot.current_index, 1);
  }

  #[test]
  fn test_corrupt_row_is_skipped() {
    let mut store = QueueStore::open_in_memory().unwrap();
    store.save(&queue_with(4, Some(0)), "local", "me").unwrap();
    store
      .connection()
      .execute("UPDATE queue_items SET track_json = '{not json' WHERE position = 1", [])
      .unwrap();

    let snapshot = store.load().unwrap();
    let ids: Vec<&str> = snapshot.tracks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, ["t0", "t2", "t3"]);
    assert_eq!(snapshot.sequence_ranks, [0, 2, 3]);
  }

  #[test]
  fn test_corrupt_row_before_cursor_keeps_current_track() {
    let mut store = QueueStore::open_in_memory().unwrap();
    store.save(&queue_with(4, Some(2)), "local", "me").unwrap();
    store
      .connection()
      .execute("UPDATE queue_items SET track_json = '{not json' WHERE position = 0", [])
      .unwrap();

    let snapshot = store.load().unwrap();
    assert_eq!(snapshot.current_index, 1);
    assert_eq!(snapshot.into_queue().current().unwrap().id, "t2");
  }

  #[test]
  fn test_corrupt_cursor_row_falls_to_neighbour() {
    let mut store = QueueStore::open_in_memory().unwrap();
    store.save(&queue_with(4, Some(2)), "local", "me").unwrap();
    store
      .connection()
      .execute("UPDATE queue_items SET track_json = X'00FF' WHERE position IN (0, 2)", [])
      .unwrap();
    assert_eq!(store.load().unwrap().into_queue().current().unwrap().id, "t3");

    store.save(&queue_with(3, Some(2)), "local", "me").unwrap();
    store
      .connection()
      .execute("UPDATE queue_items SET track_json = 'null' WHERE position = 2", [])
      .unwrap();
    assert_eq!(store.load().unwrap().into_queue().current().unwrap().id, "t1");
  }

  #[test]
  fn test_wrongly_typed_row_is_skipped() {
    let mut store = QueueStore::open_in_memory().unwrap();
    store.save(&queue_with(3, Some(0)), "local", "me").unwrap();
    store
      .connection()
      .execute("UPDATE queue_items SET track_json = X'00FF' WHERE position = 0", [])
      .unwrap();

    let snapshot = store.load().unwrap();
    assert_eq!(snapshot.tracks.len(), 2);
    assert_eq!(snapshot.tracks[0].id, "t1");
  }

  #[test]
  fn test_stale_cursor_is_clamped() {
    let mut store = QueueStore::open_in_memory().unwrap();
    store.save(&queue_with(3, Some(2)), "local", "me").unwrap();
    store
      .connection()
      .execute("DELETE FROM queue_items WHERE position >= 1", [])
      .unwrap();
    assert_eq!(store.load().unwrap().current_index, 0);

    store.connection().execute("DELETE FROM queue_items", []).unwrap();
    assert_eq!(store.load().unwrap().current_index, -1);
  }

  #[test]
  fn test_clear_resets_state_row_without_deleting_it() {
    let mut store = QueueStore::open_in_memory().unwrap();
    let mut queue = queue_with(3, Some(1));
    queue.toggle_shuffle();
    store.save(&queue, "remote", "me").unwrap();
    store.clear().unwrap();

    let rows: i64 = store
      .connection()
      .query_row("SELECT COUNT(*) FROM queue_state", [], |r| r.get(0))
      .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(store.load().unwrap(), QueueSnapshot::default());
  }

  #[test]
  fn test_failed_save_leaves_previous_snapshot() {
    let mut store = QueueStore::open_in_memory().unwrap();
    store.save(&queue_with(3, Some(1)), "local", "me").unwrap();
    store.connection().execute("DELETE FROM queue_state", []).unwrap();

    assert!(store.save(&queue_with(1, Some(0)), "local", "me").is_err());
    assert_eq!(store.load().unwrap().tracks.len(), 3);
  }

  #[test]
  fn test_state_row_is_singleton() {
    let store = QueueStore::open_in_memory().unwrap();
    let result = store
      .connection()
      .execute("INSERT INTO queue_state (id) VALUES (2)", []);
    assert!(result.is_err());
  }

  #[test]
  fn test_unknown_repeat_mode_falls_back_to_off() {
    let mut store = QueueStore::open_in_memory().unwrap();
    store.save(&queue_with(1, Some(0)), "local", "me").unwrap();
    store
      .connection()
      .execute("UPDATE queue_state SET repeat_mode = 'shuffle-ish'", [])
      .unwrap();
    assert_eq!(store.load().unwrap().repeat, RepeatMode::Off);
  }

  #[test]
  fn test_on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("queue.db");
    {
      let mut store = QueueStore::open(&path).unwrap();
      store.save(&queue_with(2, Some(1)), "local", "me").unwrap();
    }
    let store = QueueStore::open(&path).unwrap();
    let snapshot = store.load().unwrap();
    assert_eq!(snapshot.tracks.len(), 2);
    assert_eq!(snapshot.current_index, 1);
  }
}

//! Background writer so queue mutations never wait on disk.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use super::{QueueSnapshot, QueueStore};

enum PersistCommand {
  Save(QueueSnapshot),
  Clear,
  Flush(Sender<()>),
}

/// Handle to the persistence thread.
///
/// Saves are applied in order. A save that is immediately followed by another
/// save or a clear is skipped, since only the latest state matters. Failures
/// are logged and never reach the caller.
pub struct PersistHandle {
  tx: Option<Sender<PersistCommand>>,
  thread: Option<JoinHandle<()>>,
}

impl PersistHandle {
  pub fn spawn(store: QueueStore) -> Self {
    let (tx, rx) = mpsc::channel();
    let thread = thread::Builder::new()
      .name("queue-persist".into())
      .spawn(move || run(store, rx));

    match thread {
      Ok(thread) => Self {
        tx: Some(tx),
        thread: Some(thread),
      },
      Err(e) => {
        log::error!("Failed to start queue persistence thread: {}", e);
        Self { tx: None, thread: None }
      }
    }
  }

  pub fn save(&self, snapshot: QueueSnapshot) {
    self.send(PersistCommand::Save(snapshot));
  }

  pub fn clear(&self) {
    self.send(PersistCommand::Clear);
  }

  /// Block until everything queued before this call has been written.
  /// Returns false if the worker is gone.
  pub fn flush(&self) -> bool {
    let (reply_tx, reply_rx) = mpsc::channel();
    if !self.send(PersistCommand::Flush(reply_tx)) {
      return false;
    }
    reply_rx.recv().is_ok()
  }

  fn send(&self, command: PersistCommand) -> bool {
    let Some(tx) = &self.tx else {
      return false;
    };
    if tx.send(command).is_err() {
      log::warn!("Queue persistence worker has stopped");
      return false;
    }
    true
  }
}

impl Drop for PersistHandle {
  fn drop(&mut self) {
    // Closing the channel lets the worker drain and exit.
    self.tx.take();
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        log::error!("Queue persistence thread panicked");
      }
    }
  }
}

fn run(mut store: QueueStore, rx: Receiver<PersistCommand>) {
  while let Ok(first) = rx.recv() {
    let mut batch = vec![first];
    batch.extend(rx.try_iter());

    let mut batch = batch.into_iter().peekable();
    while let Some(command) = batch.next() {
      match command {
        PersistCommand::Save(snapshot) => {
          let superseded = matches!(
            batch.peek(),
            Some(PersistCommand::Save(_)) | Some(PersistCommand::Clear)
          );
          if superseded {
            continue;
          }
          if let Err(e) = store.save_snapshot(&snapshot) {
            log::error!("Failed to persist queue: {}", e);
          }
        }
        PersistCommand::Clear => {
          if let Err(e) = store.clear() {
            log::error!("Failed to clear persisted queue: {}", e);
          }
        }
        PersistCommand::Flush(reply) => {
          let _ = reply.send(());
        }
      }
    }
  }
  log::debug!("Queue persistence worker stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::Queue;
  use crate::track::Track;

  fn snapshot(n: usize) -> QueueSnapshot {
    let mut queue = Queue::with_seed(1);
    queue
      .add((0..n).map(|i| Track::new(format!("t{}", i), "x")))
      .unwrap();
    QueueSnapshot::capture(&queue, "local", "me")
  }

  #[test]
  fn test_flush_waits_for_latest_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let handle = PersistHandle::spawn(QueueStore::open(&path).unwrap());

    for n in 1..=20 {
      handle.save(snapshot(n));
    }
    assert!(handle.flush());

    let stored = QueueStore::open(&path).unwrap().load().unwrap();
    assert_eq!(stored.tracks.len(), 20);
  }

  #[test]
  fn test_clear_after_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let handle = PersistHandle::spawn(QueueStore::open(&path).unwrap());

    handle.save(snapshot(3));
    handle.clear();
    assert!(handle.flush());

    let stored = QueueStore::open(&path).unwrap().load().unwrap();
    assert!(stored.tracks.is_empty());
    assert_eq!(stored.profile_id, None);
  }

  #[test]
  fn test_drop_drains_pending_work() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    {
      let handle = PersistHandle::spawn(QueueStore::open(&path).unwrap());
      handle.save(snapshot(4));
    }
    let stored = QueueStore::open(&path).unwrap().load().unwrap();
    assert_eq!(stored.tracks.len(), 4);
  }
}

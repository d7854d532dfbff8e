//! Async IPC connection to MPV.
//!
//! Handles platform-specific socket/pipe connections, serializes outbound
//! command lines, and runs the single reader task that decodes inbound lines
//! into [`PlayerEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::event::PlayerEvent;
use super::protocol::{MpvCommand, MpvMessage, MpvResponse};
use super::reconnect::{dial_with_backoff, Backoff};

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Connection failed after {attempts} attempts: {}", .failures.join("; "))]
  ConnectExhausted { attempts: u32, failures: Vec<String> },
  #[error("Connection cancelled")]
  Cancelled,
  #[error("Write failed: {0}")]
  WriteFailed(#[from] std::io::Error),
  #[error("Encode failed: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("Command timeout")]
  Timeout,
  #[error("Disconnected")]
  Disconnected,
}

/// Backlog size at which a stalled consumer is reported.
const BACKLOG_WARN: usize = 1024;

/// Pending request waiting for response.
type PendingRequest = oneshot::Sender<MpvResponse>;

type PendingMap = Arc<Mutex<HashMap<i64, PendingRequest>>>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One duplex connection to MPV.
pub struct MpvIpc {
  writer: tokio::sync::Mutex<BoxedWriter>,
  pending: PendingMap,
  command_timeout: Duration,
  closed: Arc<AtomicBool>,
  reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MpvIpc {
  /// Connect to the MPV IPC socket/pipe, retrying on the backoff schedule.
  ///
  /// Decoded events are pushed into `event_tx`; the channel closes when the
  /// connection does.
  pub async fn connect(
    path: &str,
    backoff: &Backoff,
    cancel: &CancellationToken,
    event_tx: Sender<PlayerEvent>,
    command_timeout: Duration,
  ) -> Result<Self, IpcError> {
    let (reader, writer) = dial_with_backoff(backoff, cancel, || Self::try_connect(path)).await?;
    Ok(Self::from_io(reader, writer, event_tx, command_timeout))
  }

  #[cfg(windows)]
  async fn try_connect(
    path: &str,
  ) -> Result<
    (
      Box<dyn AsyncRead + Send + Unpin>,
      Box<dyn AsyncWrite + Send + Unpin>,
    ),
    IpcError,
  > {
    use tokio::net::windows::named_pipe::ClientOptions;

    let client = ClientOptions::new()
      .open(path)
      .map_err(|e| IpcError::ConnectionFailed(format!("Failed to open pipe: {}", e)))?;

    let (reader, writer) = tokio::io::split(client);
    Ok((Box::new(reader), Box::new(writer)))
  }

  #[cfg(not(windows))]
  async fn try_connect(
    path: &str,
  ) -> Result<
    (
      Box<dyn AsyncRead + Send + Unpin>,
      Box<dyn AsyncWrite + Send + Unpin>,
    ),
    IpcError,
  > {
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(path)
      .await
      .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;

    let (reader, writer) = stream.into_split();
    Ok((Box::new(reader), Box::new(writer)))
  }

  /// Wrap an already-open duplex stream and start the reader task.
  pub(crate) fn from_io<R, W>(
    reader: R,
    writer: W,
    event_tx: Sender<PlayerEvent>,
    command_timeout: Duration,
  ) -> Self
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

    let closed = Arc::new(AtomicBool::new(false));

    let reader_pending = pending.clone();
    let reader_closed = closed.clone();
    let reader_handle = tokio::spawn(async move {
      Self::reader_loop(reader, reader_pending, reader_closed, event_tx).await;
    });

    Self {
      writer: tokio::sync::Mutex::new(Box::new(writer)),
      pending,
      command_timeout,
      closed,
      reader_handle: Mutex::new(Some(reader_handle)),
    }
  }

  async fn reader_loop<R: AsyncRead + Unpin>(
    reader: R,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    event_tx: Sender<PlayerEvent>,
  ) {
    log::info!("MPV IPC reader loop started");
    let mut buf_reader = BufReader::new(reader);
    let mut line = Vec::new();
    // Events the channel has not accepted yet. Reading continues while they
    // wait, so replies are never stuck behind a slow consumer.
    let mut backlog: VecDeque<PlayerEvent> = VecDeque::new();

    loop {
      let read = tokio::select! {
        read = buf_reader.read_until(b'\n', &mut line) => read,
        sent = Self::forward_front(&event_tx, &backlog), if !backlog.is_empty() => {
          if sent {
            backlog.pop_front();
            Self::drain_backlog(&event_tx, &mut backlog);
          } else {
            backlog.clear();
          }
          continue;
        }
      };

      match read {
        Ok(0) => {
          // A cancelled read may have left an unterminated last line.
          if !line.is_empty() {
            Self::handle_line(&line, &pending, &mut backlog);
          }
          log::info!("MPV IPC connection closed");
          break;
        }
        Ok(_) => {
          Self::handle_line(&line, &pending, &mut backlog);
          line.clear();
          Self::drain_backlog(&event_tx, &mut backlog);
          if backlog.len() == BACKLOG_WARN {
            log::warn!("{} MPV events waiting for the consumer", BACKLOG_WARN);
          }
        }
        Err(e) => {
          log::error!("MPV IPC read error: {}", e);
          break;
        }
      }
    }

    // Marked before `event_tx` drops, so a consumer that sees the stream end
    // also sees the session as closed.
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiting caller with Disconnected.
    pending.lock().clear();

    for event in backlog {
      if event_tx.send(event).await.is_err() {
        break;
      }
    }
  }

  /// Decode one raw line: replies go to their caller, events to the backlog.
  fn handle_line(raw: &[u8], pending: &PendingMap, backlog: &mut VecDeque<PlayerEvent>) {
    let text = match std::str::from_utf8(raw) {
      Ok(text) => text.trim(),
      Err(e) => {
        log::warn!("MPV sent a line that is not valid UTF-8: {}", e);
        backlog.push_back(PlayerEvent::decode_error(format!("malformed IPC line: {}", e)));
        return;
      }
    };
    if text.is_empty() {
      return;
    }

    match MpvMessage::parse(text) {
      Ok(MpvMessage::Response(response)) => {
        log::debug!("MPV reader: response for request_id={}", response.request_id);
        if let Some(tx) = pending.lock().remove(&response.request_id) {
          let _ = tx.send(response);
        }
      }
      Ok(MpvMessage::Event(event)) => {
        log::debug!("MPV reader: event {:?}", event);
        if let Some(normalized) = PlayerEvent::from_mpv(&event) {
          backlog.push_back(normalized);
        }
      }
      Err(e) => {
        log::warn!("Failed to parse MPV message: {} - {}", e, text);
        backlog.push_back(PlayerEvent::decode_error(format!("malformed IPC line: {}", e)));
      }
    }
  }

  /// Move as many backlogged events into the channel as fit right now.
  fn drain_backlog(event_tx: &Sender<PlayerEvent>, backlog: &mut VecDeque<PlayerEvent>) {
    while let Some(event) = backlog.pop_front() {
      match event_tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
          backlog.push_front(event);
          return;
        }
        Err(TrySendError::Closed(_)) => {
          // Nobody is listening; keep reading for replies only.
          backlog.clear();
          return;
        }
      }
    }
  }

  /// Wait until the oldest backlogged event is accepted. False if the
  /// consumer is gone.
  async fn forward_front(event_tx: &Sender<PlayerEvent>, backlog: &VecDeque<PlayerEvent>) -> bool {
    match backlog.front() {
      Some(event) => event_tx.send(event.clone()).await.is_ok(),
      None => true,
    }
  }

  /// Send a command to MPV and wait for its response.
  pub async fn send_command(&self, cmd: MpvCommand) -> Result<MpvResponse, IpcError> {
    let request_id = cmd.request_id;
    let line = cmd.to_line()?;

    let (tx, rx) = oneshot::channel();
    self.pending.lock().insert(request_id, tx);

    if let Err(e) = self.write_line(&line).await {
      self.pending.lock().remove(&request_id);
      return Err(e);
    }

    match tokio::time::timeout(self.command_timeout, rx).await {
      Ok(Ok(response)) => Ok(response),
      Ok(Err(_)) => Err(IpcError::Disconnected),
      Err(_) => {
        log::error!(
          "MPV command timeout after {:?}, request_id={}",
          self.command_timeout,
          request_id
        );
        self.pending.lock().remove(&request_id);
        Err(IpcError::Timeout)
      }
    }
  }

  /// Write one full line; concurrent callers never interleave.
  async fn write_line(&self, line: &[u8]) -> Result<(), IpcError> {
    if self.is_closed() {
      return Err(IpcError::Disconnected);
    }
    log::debug!("Sending MPV command: {}", String::from_utf8_lossy(line).trim_end());
    let mut writer = self.writer.lock().await;
    writer.write_all(line).await?;
    writer.flush().await?;
    Ok(())
  }

  /// Whether the reader has stopped, either by EOF or by [`close`](Self::close).
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Close the connection and stop the reader task.
  pub async fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
    if let Some(handle) = self.reader_handle.lock().take() {
      handle.abort();
    }
    self.pending.lock().clear();
    let mut writer = self.writer.lock().await;
    if let Err(e) = writer.shutdown().await {
      log::debug!("MPV IPC shutdown: {}", e);
    }
    log::info!("MPV IPC connection closed by client");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::Value;
  use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

  struct FakeMpv {
    lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
  }

  impl FakeMpv {
    async fn next_command(&mut self) -> Value {
      let line = self.lines.next_line().await.unwrap().expect("command line");
      serde_json::from_str(&line).unwrap()
    }

    async fn push(&mut self, line: &str) {
      self.writer.write_all(line.as_bytes()).await.unwrap();
      self.writer.write_all(b"\n").await.unwrap();
    }
  }

  fn pair(timeout: Duration) -> (MpvIpc, async_channel::Receiver<PlayerEvent>, FakeMpv) {
    pair_with_capacity(timeout, 16)
  }

  fn pair_with_capacity(
    timeout: Duration,
    capacity: usize,
  ) -> (MpvIpc, async_channel::Receiver<PlayerEvent>, FakeMpv) {
    let (client, server) = duplex(4096);
    let (client_read, client_write) = split(client);
    let (server_read, server_write) = split(server);
    let (event_tx, event_rx) = async_channel::bounded(capacity);
    let ipc = MpvIpc::from_io(client_read, client_write, event_tx, timeout);
    let fake = FakeMpv {
      lines: BufReader::new(server_read).lines(),
      writer: server_write,
    };
    (ipc, event_rx, fake)
  }

  #[tokio::test]
  async fn test_response_is_routed_to_caller() {
    let (ipc, _events, mut fake) = pair(Duration::from_secs(5));
    let ipc = Arc::new(ipc);
    let sender = ipc.clone();
    let call = tokio::spawn(async move { sender.send_command(MpvCommand::quit()).await });

    let cmd = fake.next_command().await;
    assert_eq!(cmd["command"], serde_json::json!(["quit"]));
    let reply = format!(r#"{{"error":"success","request_id":{}}}"#, cmd["request_id"]);
    fake.push(&reply).await;

    let response = call.await.unwrap().unwrap();
    assert!(response.is_success());
  }

  #[tokio::test]
  async fn test_events_and_decode_errors_reach_stream_in_order() {
    let (_ipc, events, mut fake) = pair(Duration::from_secs(5));
    fake.push(r#"{"event":"property-change","name":"duration","data":180.0}"#).await;
    fake.push("{ this is not json").await;
    fake.push(r#"{"event":"property-change","name":"time-pos","data":1.0}"#).await;

    assert_eq!(events.recv().await.unwrap().duration, Some(180.0));
    assert!(events.recv().await.unwrap().error.is_some());
    assert_eq!(events.recv().await.unwrap().position, Some(1.0));
  }

  #[tokio::test]
  async fn test_invalid_utf8_line_is_reported_and_reading_continues() {
    let (_ipc, events, mut fake) = pair(Duration::from_secs(5));
    fake
      .writer
      .write_all(b"{\"event\":\"property-change\",\"name\":\"media-title\",\"data\":\"\xff\xfe\"}\n")
      .await
      .unwrap();
    fake.push(r#"{"event":"property-change","name":"pause","data":true}"#).await;

    let first = events.recv().await.unwrap();
    assert!(first.error.as_deref().unwrap().contains("malformed"));
    assert_eq!(events.recv().await.unwrap().paused, Some(true));
  }

  #[tokio::test]
  async fn test_reply_arrives_while_event_channel_is_full() {
    let (ipc, events, mut fake) = pair_with_capacity(Duration::from_secs(2), 4);
    for i in 0..10 {
      fake
        .push(&format!(r#"{{"event":"property-change","name":"time-pos","data":{}.0}}"#, i))
        .await;
    }

    let ipc = Arc::new(ipc);
    let sender = ipc.clone();
    let call = tokio::spawn(async move { sender.send_command(MpvCommand::quit()).await });
    let cmd = fake.next_command().await;
    fake
      .push(&format!(r#"{{"error":"success","request_id":{}}}"#, cmd["request_id"]))
      .await;

    assert!(call.await.unwrap().unwrap().is_success());

    // Nothing was dropped or reordered while the channel was full.
    for i in 0..10 {
      assert_eq!(events.recv().await.unwrap().position, Some(i as f64));
    }
  }

  #[tokio::test]
  async fn test_backlog_is_delivered_before_stream_closes() {
    let (_ipc, events, mut fake) = pair_with_capacity(Duration::from_secs(5), 1);
    for i in 0..5 {
      fake
        .push(&format!(r#"{{"event":"property-change","name":"time-pos","data":{}.0}}"#, i))
        .await;
    }
    drop(fake);

    for i in 0..5 {
      assert_eq!(events.recv().await.unwrap().position, Some(i as f64));
    }
    assert!(events.recv().await.is_err());
  }

  #[tokio::test]
  async fn test_stream_closes_when_peer_disconnects() {
    let (ipc, events, fake) = pair(Duration::from_secs(5));
    drop(fake);
    assert!(events.recv().await.is_err());
    let result = ipc.send_command(MpvCommand::quit()).await;
    assert!(matches!(result, Err(IpcError::Disconnected)));
  }

  #[tokio::test]
  async fn test_unanswered_command_times_out() {
    let (ipc, _events, mut fake) = pair(Duration::from_millis(50));
    let call = ipc.send_command(MpvCommand::quit());
    let (result, _) = tokio::join!(call, fake.next_command());
    assert!(matches!(result, Err(IpcError::Timeout)));
    assert!(ipc.pending.lock().is_empty());
  }

  #[tokio::test]
  async fn test_close_rejects_further_commands() {
    let (ipc, events, _fake) = pair(Duration::from_secs(5));
    ipc.close().await;
    assert!(ipc.is_closed());
    assert!(matches!(
      ipc.send_command(MpvCommand::quit()).await,
      Err(IpcError::Disconnected)
    ));
    assert!(events.recv().await.is_err());
  }
}

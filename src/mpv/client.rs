//! High-level MPV client: process lifecycle, commands and the event stream.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::event::PlayerEvent;
use super::ipc::{IpcError, MpvIpc};
use super::process::{cleanup_ipc, default_ipc_path, kill_and_reap, spawn_mpv, ProcessError};
use super::protocol::{MpvCommand, MpvResponse, HEADER_FIELDS_PROPERTY, OBSERVED_PROPERTIES};
use super::reconnect::Backoff;

/// How long `stop` waits for mpv to acknowledge `quit` before killing it.
const QUIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum MpvError {
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
  #[error("MPV command failed: {0}")]
  CommandFailed(String),
  #[error("Not connected")]
  NotConnected,
  #[error("Session is already starting")]
  Busy,
}

/// Lifecycle of one player session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Idle,
  Connecting,
  Connected,
  Closing,
  Closed,
}

/// Settings for spawning and reaching MPV.
#[derive(Debug, Clone)]
pub struct MpvOptions {
  /// Custom MPV executable (None = auto-detect).
  pub mpv_path: Option<PathBuf>,
  /// Arguments appended after the fixed headless flags.
  pub extra_args: Vec<String>,
  /// Spawn MPV ourselves, or attach to one already listening on `ipc_path`.
  pub spawn: bool,
  pub ipc_path: String,
  pub backoff: Backoff,
  pub command_timeout: Duration,
  /// Capacity of the event stream.
  pub event_capacity: usize,
}

impl Default for MpvOptions {
  fn default() -> Self {
    Self {
      mpv_path: None,
      extra_args: Vec::new(),
      spawn: true,
      ipc_path: default_ipc_path(),
      backoff: Backoff::default(),
      command_timeout: Duration::from_secs(5),
      event_capacity: 64,
    }
  }
}

/// Everything owned by one session, guarded by a single lock.
struct Session {
  state: SessionState,
  process: Option<Child>,
  ipc: Option<Arc<MpvIpc>>,
  events: Option<Receiver<PlayerEvent>>,
  done: CancellationToken,
  /// Whether the last `play` installed header overrides.
  headers_set: bool,
}

/// Clamp a requested volume into mpv's 0-100 range.
pub fn clamp_volume(volume: f64) -> f64 {
  if volume.is_nan() {
    return 0.0;
  }
  volume.clamp(0.0, 100.0)
}

/// High-level MPV client.
#[derive(Clone)]
pub struct MpvClient {
  options: Arc<MpvOptions>,
  session: Arc<Mutex<Session>>,
}

impl MpvClient {
  /// Create a new MPV client. Nothing is spawned until [`start`](Self::start).
  pub fn new(options: MpvOptions) -> Self {
    Self {
      options: Arc::new(options),
      session: Arc::new(Mutex::new(Session {
        state: SessionState::Idle,
        process: None,
        ipc: None,
        events: None,
        done: CancellationToken::new(),
        headers_set: false,
      })),
    }
  }

  /// Current lifecycle state.
  pub fn state(&self) -> SessionState {
    self.session.lock().state
  }

  /// Check if connected.
  pub fn is_connected(&self) -> bool {
    self.ipc().is_ok()
  }

  /// Completion signal of the current session, cancelled exactly once by `stop`.
  pub fn done(&self) -> CancellationToken {
    self.session.lock().done.clone()
  }

  /// Event stream of the current session. `None` before the first start.
  ///
  /// The stream ends when the connection closes.
  pub fn events(&self) -> Option<Receiver<PlayerEvent>> {
    self.session.lock().events.clone()
  }

  /// Spawn MPV (when configured to), connect, and observe tracked properties.
  ///
  /// Any failure is fatal for this session: everything acquired so far is
  /// released before the error is returned. Cancelling `ctx` aborts the
  /// connection schedule.
  pub async fn start(&self, ctx: &CancellationToken) -> Result<(), MpvError> {
    let done = {
      let mut session = self.session.lock();
      match session.state {
        SessionState::Connected => {
          log::debug!("start() called on a connected session");
          return Ok(());
        }
        SessionState::Connecting | SessionState::Closing => return Err(MpvError::Busy),
        SessionState::Idle | SessionState::Closed => {}
      }
      session.state = SessionState::Connecting;
      session.done = ctx.child_token();
      session.headers_set = false;
      session.done.clone()
    };

    match self.establish(&done).await {
      Ok(()) => {
        log::info!("MPV client connected on {}", self.options.ipc_path);
        Ok(())
      }
      Err(e) => {
        log::error!("MPV start failed: {}", e);
        self.abandon_start().await;
        Err(e)
      }
    }
  }

  async fn establish(&self, done: &CancellationToken) -> Result<(), MpvError> {
    let opts = &self.options;

    if opts.spawn {
      cleanup_ipc(&opts.ipc_path);
      let child = spawn_mpv(opts.mpv_path.as_deref(), &opts.ipc_path, &opts.extra_args)?;
      let orphan = {
        let mut session = self.session.lock();
        if session.state == SessionState::Connecting {
          session.process = Some(child);
          None
        } else {
          Some(child)
        }
      };
      // stop() ran while spawning and will not see this child
      if let Some(child) = orphan {
        self.release(None, Some(child)).await;
        return Err(IpcError::Cancelled.into());
      }
    }

    let (event_tx, event_rx) = async_channel::bounded(opts.event_capacity.max(1));
    let ipc = MpvIpc::connect(&opts.ipc_path, &opts.backoff, done, event_tx, opts.command_timeout).await?;
    let ipc = Arc::new(ipc);

    let accepted = {
      let mut session = self.session.lock();
      if session.state == SessionState::Connecting {
        session.ipc = Some(ipc.clone());
        session.events = Some(event_rx);
        true
      } else {
        false
      }
    };
    if !accepted {
      ipc.close().await;
      return Err(IpcError::Cancelled.into());
    }

    for (id, name) in OBSERVED_PROPERTIES {
      Self::check(ipc.send_command(MpvCommand::observe_property(id, name)).await?)?;
    }

    let mut session = self.session.lock();
    if session.state != SessionState::Connecting {
      return Err(IpcError::Cancelled.into());
    }
    session.state = SessionState::Connected;
    Ok(())
  }

  /// Release what a failed start acquired, unless `stop` already owns teardown.
  async fn abandon_start(&self) {
    let (ipc, child) = {
      let mut session = self.session.lock();
      if session.state != SessionState::Connecting {
        return;
      }
      session.state = SessionState::Closing;
      session.events = None;
      session.done.cancel();
      (session.ipc.take(), session.process.take())
    };
    self.release(ipc, child).await;
  }

  /// Stop MPV and disconnect.
  ///
  /// Safe to call at any time, concurrently, and before `start`. Only the
  /// first call does any work.
  pub async fn stop(&self) {
    let (ipc, child) = {
      let mut session = self.session.lock();
      match session.state {
        SessionState::Closing | SessionState::Closed => return,
        SessionState::Idle => {
          session.state = SessionState::Closed;
          session.done.cancel();
          return;
        }
        SessionState::Connecting | SessionState::Connected => {}
      }
      log::info!("stop() called in state {:?}", session.state);
      session.state = SessionState::Closing;
      session.events = None;
      session.done.cancel();
      (session.ipc.take(), session.process.take())
    };

    if let Some(ipc) = &ipc {
      match tokio::time::timeout(QUIT_GRACE, ipc.send_command(MpvCommand::quit())).await {
        Ok(Ok(_)) => log::debug!("MPV acknowledged quit"),
        Ok(Err(e)) => log::debug!("quit not acknowledged: {}", e),
        Err(_) => log::debug!("quit not acknowledged within {:?}", QUIT_GRACE),
      }
    }

    self.release(ipc, child).await;
    log::info!("MPV client stopped");
  }

  /// Close the connection, reap the process and mark the session closed.
  async fn release(&self, ipc: Option<Arc<MpvIpc>>, child: Option<Child>) {
    if let Some(ipc) = ipc {
      ipc.close().await;
    }

    if let Some(child) = child {
      // kill/wait block; keep them off the async runtime
      if let Err(e) = tokio::task::spawn_blocking(move || kill_and_reap(child)).await {
        log::error!("spawn_blocking panicked during process cleanup: {}", e);
      }
    }

    if self.options.spawn {
      cleanup_ipc(&self.options.ipc_path);
    }

    self.session.lock().state = SessionState::Closed;
  }

  /// Get the live IPC connection.
  fn ipc(&self) -> Result<Arc<MpvIpc>, MpvError> {
    let session = self.session.lock();
    match (&session.state, &session.ipc) {
      (SessionState::Connected, Some(ipc)) if !ipc.is_closed() => Ok(ipc.clone()),
      _ => Err(MpvError::NotConnected),
    }
  }

  fn check(response: MpvResponse) -> Result<MpvResponse, MpvError> {
    if response.is_success() {
      Ok(response)
    } else {
      Err(MpvError::CommandFailed(response.error))
    }
  }

  /// Send a command to MPV.
  async fn send(&self, cmd: MpvCommand) -> Result<MpvResponse, MpvError> {
    let ipc = self.ipc()?;
    Self::check(ipc.send_command(cmd).await?)
  }

  /// Replace the current media with `url`.
  ///
  /// Non-empty `headers` are installed as request header overrides first;
  /// overrides left by a previous call are cleared when `headers` is empty.
  pub async fn play(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<(), MpvError> {
    let had_headers = {
      let session = self.session.lock();
      session.headers_set
    };

    if !headers.is_empty() {
      let fields: Vec<Value> = headers
        .iter()
        .map(|(name, value)| Value::String(format!("{}: {}", name, value)))
        .collect();
      self
        .send(MpvCommand::set_property(HEADER_FIELDS_PROPERTY, Value::Array(fields)))
        .await?;
      self.session.lock().headers_set = true;
    } else if had_headers {
      self
        .send(MpvCommand::set_property(HEADER_FIELDS_PROPERTY, Value::Array(Vec::new())))
        .await?;
      self.session.lock().headers_set = false;
    }

    log::info!("Loading file: {}", redact_url(url));
    self.send(MpvCommand::loadfile_replace(url)).await?;
    Ok(())
  }

  /// Set pause state.
  pub async fn toggle_pause(&self, paused: bool) -> Result<(), MpvError> {
    self.send(MpvCommand::set_property("pause", paused.into())).await?;
    Ok(())
  }

  /// Seek relative to the current position.
  pub async fn seek(&self, delta_seconds: f64) -> Result<(), MpvError> {
    self.send(MpvCommand::seek_relative(delta_seconds)).await?;
    Ok(())
  }

  /// Set volume, clamped to 0-100.
  pub async fn set_volume(&self, volume: f64) -> Result<(), MpvError> {
    let volume = clamp_volume(volume);
    self.send(MpvCommand::set_property("volume", volume.into())).await?;
    Ok(())
  }

  /// Set mute state.
  pub async fn set_mute(&self, muted: bool) -> Result<(), MpvError> {
    self.send(MpvCommand::set_property("mute", muted.into())).await?;
    Ok(())
  }
}

/// Strip the query string, which may carry tokens, before logging a URL.
pub fn redact_url(url: &str) -> &str {
  url.split_once('?').map_or(url, |(base, _)| base)
}

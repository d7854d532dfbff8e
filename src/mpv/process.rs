//! MPV process detection and spawning.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV: {0}")]
  SpawnFailed(#[from] std::io::Error),
}

/// Default IPC socket/pipe path for MPV, unique to this process.
pub fn default_ipc_path() -> String {
  let pid = std::process::id();
  #[cfg(windows)]
  {
    format!(r"\\.\pipe\termtune-mpv-{}", pid)
  }
  #[cfg(not(windows))]
  {
    std::env::temp_dir()
      .join(format!("termtune-mpv-{}.sock", pid))
      .to_string_lossy()
      .into_owned()
  }
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  #[cfg(windows)]
  let common_paths: &[&str] = &[
    r"C:\Program Files\mpv\mpv.exe",
    r"C:\Program Files (x86)\mpv\mpv.exe",
    r"C:\mpv\mpv.exe",
  ];
  #[cfg(target_os = "macos")]
  let common_paths: &[&str] = &[
    "/usr/local/bin/mpv",
    "/opt/homebrew/bin/mpv",
    "/Applications/mpv.app/Contents/MacOS/mpv",
  ];
  #[cfg(not(any(windows, target_os = "macos")))]
  let common_paths: &[&str] = &["/usr/bin/mpv", "/usr/local/bin/mpv"];

  common_paths.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Fixed arguments for a headless, audio-only player listening on `ipc_path`.
pub fn mpv_args(ipc_path: &str, extra_args: &[String]) -> Vec<String> {
  let mut args = vec![
    "--idle=yes".to_string(),
    "--force-window=no".to_string(),
    "--no-terminal".to_string(),
    "--no-video".to_string(),
    format!("--input-ipc-server={}", ipc_path),
  ];
  args.extend(extra_args.iter().cloned());
  args
}

/// Spawn MPV process with IPC server enabled.
pub fn spawn_mpv(
  mpv_path: Option<&Path>,
  ipc_path: &str,
  extra_args: &[String],
) -> Result<Child, ProcessError> {
  let mpv_exe = mpv_path
    .map(Path::to_path_buf)
    .or_else(find_mpv)
    .ok_or(ProcessError::NotFound)?;

  let args = mpv_args(ipc_path, extra_args);
  log::info!("Spawning MPV: {:?} {:?}", mpv_exe, args);

  let child = Command::new(&mpv_exe)
    .args(&args)
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .spawn()?;

  Ok(child)
}

/// Kill a spawned MPV and reap it so no zombie is left behind.
pub fn kill_and_reap(mut child: Child) {
  let pid = child.id();
  match child.try_wait() {
    Ok(Some(status)) => {
      log::info!("MPV process {} already exited with: {}", pid, status);
      return;
    }
    Ok(None) => {}
    Err(e) => log::warn!("try_wait() on MPV {} failed: {}", pid, e),
  }

  if let Err(e) = child.kill() {
    log::error!("kill() on MPV {} failed: {}", pid, e);
  }
  match child.wait() {
    Ok(status) => log::info!("MPV process {} exited with: {}", pid, status),
    Err(e) => log::error!("wait() on MPV {} failed: {}", pid, e),
  }
}

/// Remove a stale IPC socket file.
pub fn cleanup_ipc(ipc_path: &str) {
  #[cfg(not(windows))]
  {
    match std::fs::remove_file(ipc_path) {
      Ok(()) => log::debug!("Removed IPC socket {}", ipc_path),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => log::warn!("Failed to remove IPC socket {}: {}", ipc_path, e),
    }
  }
  // Windows named pipes are cleaned up automatically
  #[cfg(windows)]
  let _ = ipc_path;
}

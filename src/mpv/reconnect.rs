//! Bounded exponential backoff for establishing the IPC connection.
//!
//! mpv creates its IPC endpoint some time after the process starts, so the
//! first few dials routinely fail.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::ipc::IpcError;

/// Upper bound of the random jitter, as a fraction of the computed delay.
const JITTER_FRACTION: f64 = 0.2;

/// Retry schedule for dialing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  /// Total number of dial attempts.
  pub attempts: u32,
  pub base: Duration,
  pub max: Duration,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      attempts: 10,
      base: Duration::from_millis(100),
      max: Duration::from_secs(2),
    }
  }
}

impl Backoff {
  /// Delay after failed attempt `attempt` (zero-based), before jitter.
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    self.base.saturating_mul(factor).min(self.max)
  }

  /// Delay with up to 20% random jitter added.
  pub fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
    let delay = self.delay(attempt);
    let jitter = rng.gen_range(0.0..=JITTER_FRACTION);
    delay + delay.mul_f64(jitter)
  }
}

/// Dial until success, cancellation, or the attempt budget runs out.
///
/// Every failure is kept and reported in [`IpcError::ConnectExhausted`].
pub async fn dial_with_backoff<T, E, F, Fut>(
  backoff: &Backoff,
  cancel: &CancellationToken,
  mut dial: F,
) -> Result<T, IpcError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Display,
{
  let mut failures = Vec::new();

  for attempt in 0..backoff.attempts {
    if cancel.is_cancelled() {
      return Err(IpcError::Cancelled);
    }

    let result = tokio::select! {
      _ = cancel.cancelled() => return Err(IpcError::Cancelled),
      result = dial() => result,
    };

    match result {
      Ok(conn) => {
        if attempt > 0 {
          log::info!("IPC connected after {} attempts", attempt + 1);
        }
        return Ok(conn);
      }
      Err(e) => {
        log::debug!("IPC connect attempt {} failed: {}", attempt + 1, e);
        failures.push(e.to_string());
      }
    }

    if attempt + 1 < backoff.attempts {
      let delay = backoff.jittered_delay(attempt, &mut rand::thread_rng());
      tokio::select! {
        _ = cancel.cancelled() => return Err(IpcError::Cancelled),
        _ = tokio::time::sleep(delay) => {}
      }
    }
  }

  Err(IpcError::ConnectExhausted {
    attempts: backoff.attempts,
    failures,
  })
}

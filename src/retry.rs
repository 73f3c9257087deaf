//! Exponential backoff shared by the resource client and async queries.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::ServiceError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// `max_retries` extra attempts after the first, waiting `base_delay * 2^attempt` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay: Duration,
}

impl RetryPolicy {
  pub fn new(max_retries: u32, base_delay: Duration) -> Self {
    Self {
      max_retries,
      base_delay,
    }
  }

  pub fn none() -> Self {
    Self::new(0, Duration::ZERO)
  }

  /// Delay before retrying after the failed attempt `attempt` (0-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
  }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the budget is spent.
///
/// `op` receives the 0-based attempt index. Cancelling `cancel` interrupts both a
/// running attempt and a pending backoff sleep with a `CANCELLED` error.
pub async fn retry<T, F, Fut>(
  policy: RetryPolicy,
  cancel: Option<&CancellationToken>,
  mut op: F,
) -> Result<T, ServiceError>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Result<T, ServiceError>>,
{
  let mut attempt = 0;
  loop {
    let result = until_cancelled(cancel, op(attempt)).await;

    match result {
      Ok(value) => return Ok(value),
      Err(err) if attempt < policy.max_retries && err.is_retryable() => {
        let delay = policy.delay_for(attempt);
        debug!(
          attempt = attempt + 1,
          delay_ms = delay.as_millis() as u64,
          error = %err,
          "Retrying after failure"
        );
        until_cancelled(cancel, async {
          tokio::time::sleep(delay).await;
          Ok(())
        })
        .await?;
        attempt += 1;
      }
      Err(err) => return Err(err),
    }
  }
}

/// Race `fut` against the token, if there is one.
pub async fn until_cancelled<T, Fut>(
  cancel: Option<&CancellationToken>,
  fut: Fut,
) -> Result<T, ServiceError>
where
  Fut: Future<Output = Result<T, ServiceError>>,
{
  match cancel {
    Some(token) if token.is_cancelled() => Err(ServiceError::cancelled()),
    Some(token) => {
      tokio::select! {
        result = fut => result,
        _ = token.cancelled() => Err(ServiceError::cancelled()),
      }
    }
    None => fut.await,
  }
}

/// Bound a single attempt. An elapsed timeout is reported like a lost request.
pub async fn with_timeout<T, Fut>(timeout: Option<Duration>, fut: Fut) -> Result<T, ServiceError>
where
  Fut: Future<Output = Result<T, ServiceError>>,
{
  match timeout {
    Some(limit) => tokio::time::timeout(limit, fut)
      .await
      .unwrap_or_else(|_| Err(ServiceError::timeout(limit))),
    None => fut.await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn counting_failure(
    calls: &Arc<AtomicU32>,
    err: ServiceError,
  ) -> impl FnMut(u32) -> futures::future::Ready<Result<(), ServiceError>> {
    let calls = calls.clone();
    move |_| {
      calls.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(Err(err.clone()))
    }
  }

  #[test]
  fn test_delay_doubles() {
    let policy = RetryPolicy::new(3, Duration::from_millis(100));
    assert_eq!(policy.delay_for(0), Duration::from_millis(100));
    assert_eq!(policy.delay_for(1), Duration::from_millis(200));
    assert_eq!(policy.delay_for(2), Duration::from_millis(400));
  }

  #[tokio::test(start_paused = true)]
  async fn test_always_failing_makes_max_retries_plus_one_calls() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::new(3, Duration::from_millis(10));
    let err = retry(policy, None, counting_failure(&calls, ServiceError::from_status(500, None)))
      .await
      .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(err.status, Some(500));
  }

  #[tokio::test(start_paused = true)]
  async fn test_client_error_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let err = retry(
      RetryPolicy::default(),
      None,
      counting_failure(&calls, ServiceError::from_status(422, None)),
    )
    .await
    .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.status, Some(422));
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovers_after_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let result = retry(RetryPolicy::new(3, Duration::from_millis(10)), None, move |attempt| {
      counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if attempt < 2 {
          Err(ServiceError::network("reset"))
        } else {
          Ok("done")
        }
      }
    })
    .await;
    assert_eq!(result, Ok("done"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_backoff_waits_between_attempts() {
    let start = tokio::time::Instant::now();
    let calls = Arc::new(AtomicU32::new(0));
    let _ = retry(
      RetryPolicy::new(2, Duration::from_millis(100)),
      None,
      counting_failure(&calls, ServiceError::network("down")),
    )
    .await;
    // 100ms + 200ms of backoff
    assert!(start.elapsed() >= Duration::from_millis(300));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_interrupts_backoff() {
    let token = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    let canceller = {
      let token = token.clone();
      tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
      })
    };
    let err = retry(
      RetryPolicy::new(5, Duration::from_secs(10)),
      Some(&token),
      counting_failure(&calls, ServiceError::network("down")),
    )
    .await
    .unwrap_err();
    canceller.await.unwrap();
    assert!(err.is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_is_retryable_error() {
    let err = with_timeout(Some(Duration::from_millis(20)), async {
      tokio::time::sleep(Duration::from_secs(1)).await;
      Ok::<_, ServiceError>(())
    })
    .await
    .unwrap_err();
    assert!(err.has_code(crate::error::codes::TIMEOUT));
    assert!(err.is_retryable());
  }
}

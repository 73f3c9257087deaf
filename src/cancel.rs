//! Explicit cancellation tokens.
//!
//! A token is passed into each call and compared by identity. Cancelling does
//! not abort the underlying transport; it stops retries and backoff sleeps and
//! lets callers drop results that arrive afterwards.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
  id: u64,
  cancelled: AtomicBool,
  notify: Notify,
}

#[derive(Clone)]
pub struct CancellationToken {
  inner: Arc<Inner>,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
        cancelled: AtomicBool::new(false),
        notify: Notify::new(),
      }),
    }
  }

  /// Process-unique identity of this token.
  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn cancel(&self) {
    if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
      self.inner.notify.notify_waiters();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::SeqCst)
  }

  /// Resolves once the token is cancelled.
  pub async fn cancelled(&self) {
    loop {
      let notified = self.inner.notify.notified();
      if self.is_cancelled() {
        return;
      }
      notified.await;
    }
  }

  pub fn same_as(&self, other: &CancellationToken) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl Default for CancellationToken {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for CancellationToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CancellationToken")
      .field("id", &self.inner.id)
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

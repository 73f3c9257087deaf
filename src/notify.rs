//! User-facing notifications emitted by CRUD mutations.
//!
//! Presentation (toast, banner, status line) lives outside the core; the core
//! hands a [`Notification`] to whatever [`Notifier`] it was built with.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
  Info,
  Success,
  Warning,
  Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
  pub level: NotificationLevel,
  pub message: String,
  pub created_at: DateTime<Utc>,
}

impl Notification {
  pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
    Self {
      level,
      message: message.into(),
      created_at: Utc::now(),
    }
  }

  pub fn success(message: impl Into<String>) -> Self {
    Self::new(NotificationLevel::Success, message)
  }

  pub fn error(message: impl Into<String>) -> Self {
    Self::new(NotificationLevel::Error, message)
  }
}

pub trait Notifier: Send + Sync {
  fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  fn notify(&self, notification: Notification) {
    match notification.level {
      NotificationLevel::Info | NotificationLevel::Success => {
        info!(message = %notification.message, "Notification")
      }
      NotificationLevel::Warning => warn!(message = %notification.message, "Notification"),
      NotificationLevel::Error => error!(message = %notification.message, "Notification"),
    }
  }
}

/// Keeps every notification in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingNotifier {
  seen: std::sync::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotifier {
  pub fn take(&self) -> Vec<Notification> {
    std::mem::take(&mut *self.seen.lock().unwrap())
  }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
  fn notify(&self, notification: Notification) {
    self.seen.lock().unwrap().push(notification);
  }
}

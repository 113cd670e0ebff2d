//! User-facing notification boundary.
//!
//! Notifications are `(title, message, severity)` triples handed to a
//! [`NotificationSink`]. Delivery is fire-and-forget: sinks never report
//! back and must not block.

use serde::Serialize;

use crate::types::Timestamp;

/// Title used for every success notification.
pub const TITLE_SUCCESS: &str = "Success";

/// Title used for every error notification.
pub const TITLE_ERROR: &str = "Error";

/// Fallback message when a failure carries no readable message.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

/// Visual severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

/// A single toast-style message for the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub created_at: Timestamp,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(TITLE_SUCCESS, message, Severity::Success)
    }

    /// Error notification; an empty message falls back to
    /// [`UNKNOWN_ERROR_MESSAGE`].
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            UNKNOWN_ERROR_MESSAGE.to_string()
        } else {
            message
        };
        Self::new(TITLE_ERROR, message, Severity::Error)
    }
}

/// Receiver of user-facing notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sink that writes notifications to the tracing log.
///
/// Used by headless front ends that have no toast surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        match notification.severity {
            Severity::Error => tracing::error!(
                title = %notification.title,
                "{}",
                notification.message,
            ),
            Severity::Warning => tracing::warn!(
                title = %notification.title,
                "{}",
                notification.message,
            ),
            Severity::Success | Severity::Info => tracing::info!(
                title = %notification.title,
                "{}",
                notification.message,
            ),
        }
    }
}

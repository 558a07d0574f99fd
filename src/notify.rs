use crate::metrics::{Notification, NotificationKind};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// How long a notification stays visible
pub const NOTIFICATION_TTL: Duration = Duration::from_secs(3);

/// Where user-facing messages go
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Holds the one visible notification and dismisses it once it expires.
/// Every message is also logged.
#[derive(Debug)]
pub struct NotificationBoard {
    ttl: Duration,
    current: Mutex<Option<(Notification, Instant)>>,
}

impl Default for NotificationBoard {
    fn default() -> Self {
        Self::new(NOTIFICATION_TTL)
    }
}

impl NotificationBoard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            current: Mutex::new(None),
        }
    }

    /// The visible notification, if it has not expired yet
    pub fn current(&self) -> Option<Notification> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some((_, shown_at)) if shown_at.elapsed() >= self.ttl => {
                *current = None;
                None
            }
            Some((notification, _)) => Some(notification.clone()),
            None => None,
        }
    }

    pub fn dismiss(&self) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl Notifier for NotificationBoard {
    fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Error => error!(message = %notification.message, "Notification"),
            _ => info!(kind = ?notification.kind, message = %notification.message, "Notification"),
        }
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some((notification, Instant::now()));
    }
}

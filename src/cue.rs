//! Attention cue capability (badge shake, sound, vibration).
use tracing::info;

use crate::model::Notification;

/// Transient signal that a notification is genuinely new to this client.
pub trait AttentionCue: Send + Sync {
    fn raise(&self, notification: &Notification);
}

/// Fallback when the platform offers no feedback capability.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCue;

impl AttentionCue for NoopCue {
    fn raise(&self, _notification: &Notification) {}
}

/// Terminal rendition used by the binary: the cue is a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCue;

impl AttentionCue for LogCue {
    fn raise(&self, notification: &Notification) {
        info!(
            id = %notification.id,
            kind = ?notification.kind,
            event_id = ?notification.related_event_id,
            "new: {}",
            notification.message
        );
    }
}

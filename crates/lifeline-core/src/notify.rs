//! User-visible signals
//!
//! Components never talk to the UI directly; they publish [`Notification`]s and
//! whoever renders the app decides how to show them.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::EntityKey;

/// Something the user should be told about
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A queued action was abandoned ("could not sync")
    SyncFailed {
        action_id: String,
        entity: EntityKey,
        reason: String,
    },
    /// An optimistic change was rolled back ("change could not be saved")
    ChangeNotSaved { entity: EntityKey, reason: String },
    /// Credentials were cleared; the user must sign in again
    SessionExpired,
    /// The live channel gave up reconnecting
    RealtimeUnavailable,
    /// Server-pushed notice (badge earned, friend request, reminder, ...)
    Remote { event_type: String, payload: Value },
}

/// Broadcast hub for notifications
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("notification dropped, nobody is listening");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}

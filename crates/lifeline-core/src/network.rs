//! Online/offline observation
//!
//! The transport and the sync worker never probe the network themselves; they
//! ask a [`NetworkObserver`]. The platform layer (or a test) feeds it.

use tokio::sync::watch;

/// Reports whether the device currently believes it is online
pub trait NetworkObserver: Send + Sync {
    fn is_online(&self) -> bool;

    /// Receiver that changes whenever connectivity flips
    fn watch(&self) -> watch::Receiver<bool>;
}

/// Manually driven connectivity flag
#[derive(Debug)]
pub struct NetworkStatus {
    tx: watch::Sender<bool>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    /// Record a connectivity change; receivers are only woken on a real flip
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl NetworkObserver for NetworkStatus {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

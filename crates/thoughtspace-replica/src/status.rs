//! Observable sync status and user-facing alerts.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// Relay connection state as shown to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not yet attempted.
    Preconnecting,
    Connecting,
    Connected,
    /// Local data is available while the connection is re-established.
    Reconnecting,
    Offline,
}

struct StatusInner {
    replication_progress: watch::Sender<f64>,
    saving_progress: watch::Sender<f64>,
    is_pulling: watch::Sender<bool>,
    connection: watch::Sender<ConnectionStatus>,
}

/// Progress values are in `0.0..=1.0`; `1.0` means idle.
#[derive(Clone)]
pub struct SyncStatus {
    inner: Arc<StatusInner>,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                replication_progress: watch::channel(1.0).0,
                saving_progress: watch::channel(1.0).0,
                is_pulling: watch::channel(false).0,
                connection: watch::channel(ConnectionStatus::Preconnecting).0,
            }),
        }
    }

    pub fn replication_progress(&self) -> f64 {
        *self.inner.replication_progress.borrow()
    }

    pub fn set_replication_progress(&self, progress: f64) {
        self.inner.replication_progress.send_replace(progress);
    }

    pub fn subscribe_replication_progress(&self) -> watch::Receiver<f64> {
        self.inner.replication_progress.subscribe()
    }

    pub fn saving_progress(&self) -> f64 {
        *self.inner.saving_progress.borrow()
    }

    pub fn set_saving_progress(&self, progress: f64) {
        self.inner.saving_progress.send_replace(progress);
    }

    pub fn subscribe_saving_progress(&self) -> watch::Receiver<f64> {
        self.inner.saving_progress.subscribe()
    }

    pub fn is_pulling(&self) -> bool {
        *self.inner.is_pulling.borrow()
    }

    pub fn set_pulling(&self, pulling: bool) {
        self.inner.is_pulling.send_replace(pulling);
    }

    pub fn subscribe_pulling(&self) -> watch::Receiver<bool> {
        self.inner.is_pulling.subscribe()
    }

    pub fn connection(&self) -> ConnectionStatus {
        *self.inner.connection.borrow()
    }

    pub fn set_connection(&self, status: ConnectionStatus) {
        self.inner.connection.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.subscribe()
    }

    pub fn is_offline(&self) -> bool {
        self.connection() == ConnectionStatus::Offline
    }

    /// Resolves once the connection is reported offline.
    pub async fn offline(&self) {
        let mut rx = self.inner.connection.subscribe();
        if rx
            .wait_for(|status| *status == ConnectionStatus::Offline)
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable error notifications for the user.
pub struct Alerts {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Alerts {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn alert(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(alert = %message, "User alert");
        let _ = self.tx.send(message);
    }

    /// The alert stream. Can be taken once.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.rx.lock().take()
    }
}

impl Default for Alerts {
    fn default() -> Self {
        Self::new()
    }
}

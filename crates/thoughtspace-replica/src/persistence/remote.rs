//! Relay persistence adapter.

use super::SyncState;
use crate::error::RelayError;
use crate::name::DocumentName;
use crate::shared::{DocEvent, Origin, SharedDoc};
use crate::status::{ConnectionStatus, SyncStatus};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thoughtspace_crdt::{ReplicaId, Replicated};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, warn};

/// An update pushed to the relay by one of its connections.
#[derive(Clone, Debug)]
pub struct RelayMessage {
    pub sender: ReplicaId,
    pub update: Arc<Vec<u8>>,
}

/// The websocket relay shared by every device of a thoughtspace. It stores
/// and forwards opaque update bytes per document.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// Exchange state with the relay. `state` is the sender's full state,
    /// or `None` if it has nothing yet. Returns every update the relay
    /// holds for the document.
    async fn sync(
        &self,
        name: &DocumentName,
        token: &str,
        sender: &ReplicaId,
        state: Option<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, RelayError>;

    async fn push(
        &self,
        name: &DocumentName,
        token: &str,
        sender: &ReplicaId,
        update: Vec<u8>,
    ) -> Result<(), RelayError>;

    /// Updates pushed by any connection, the subscriber's own included.
    fn subscribe(&self, name: &DocumentName) -> broadcast::Receiver<RelayMessage>;
}

/// What a document needs to talk to the relay.
#[derive(Clone)]
pub struct RelayLink {
    pub relay: Arc<dyn Relay>,
    pub token: String,
    pub replica: ReplicaId,
    pub status: SyncStatus,
    pub retry_delay: Duration,
}

/// Keeps a document in sync with the relay: an initial state exchange,
/// then live forwarding in both directions. Any failure drops back to a
/// full state exchange once the relay is reachable again.
pub struct RemotePersistence {
    name: DocumentName,
    state: watch::Receiver<SyncState>,
}

impl RemotePersistence {
    pub fn open<D: Replicated>(doc: SharedDoc<D>, link: RelayLink) -> Self {
        let name = doc.name().clone();
        let (state_tx, state) = watch::channel(SyncState::Pending);
        let events = doc.subscribe();
        let incoming = link.relay.subscribe(&name);
        tokio::spawn(run(doc, link, events, incoming, state_tx));
        Self { name, state }
    }

    pub fn name(&self) -> &DocumentName {
        &self.name
    }

    /// Resolves after the first successful exchange with the relay, or when
    /// the document is destroyed before that happens.
    pub async fn when_synced(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SyncState::Synced).await;
    }

    pub fn is_synced(&self) -> bool {
        *self.state.borrow() == SyncState::Synced
    }
}

enum Forwarded {
    Destroyed,
    Resync,
}

async fn run<D: Replicated>(
    doc: SharedDoc<D>,
    link: RelayLink,
    mut events: broadcast::Receiver<DocEvent>,
    mut incoming: broadcast::Receiver<RelayMessage>,
    state: watch::Sender<SyncState>,
) {
    loop {
        if !exchange(&doc, &link).await {
            return;
        }
        state.send_replace(SyncState::Synced);

        match forward(&doc, &link, &mut events, &mut incoming).await {
            Forwarded::Destroyed => return,
            Forwarded::Resync => continue,
        }
    }
}

/// Full state exchange, retried until it succeeds. Returns false if the
/// document was destroyed first.
async fn exchange<D: Replicated>(doc: &SharedDoc<D>, link: &RelayLink) -> bool {
    let name = doc.name();
    if link.status.connection() == ConnectionStatus::Preconnecting {
        link.status.set_connection(ConnectionStatus::Connecting);
    }

    loop {
        if doc.is_destroyed() {
            return false;
        }

        let state = doc.read(|d| {
            if d.is_empty() {
                Ok(None)
            } else {
                d.encode_state().map(Some)
            }
        });
        let state = match state {
            Ok(state) => state,
            Err(e) => {
                warn!(document = %name, error = %e, "Failed to encode state for relay");
                None
            }
        };

        match link
            .relay
            .sync(name, &link.token, &link.replica, state)
            .await
        {
            Ok(updates) => {
                for update in &updates {
                    if let Err(e) = doc.apply(update, Origin::Relay) {
                        warn!(document = %name, error = %e, "Skipping unreadable relay update");
                    }
                }
                link.status.set_connection(ConnectionStatus::Connected);
                debug!(document = %name, updates = updates.len(), "Synced with relay");
                return true;
            }
            Err(RelayError::Offline) => {
                link.status.set_connection(ConnectionStatus::Offline);
            }
            Err(e) => {
                warn!(document = %name, error = %e, "Relay sync failed");
            }
        }

        tokio::select! {
            _ = doc.destroyed() => return false,
            _ = tokio::time::sleep(link.retry_delay) => {}
        }
    }
}

async fn forward<D: Replicated>(
    doc: &SharedDoc<D>,
    link: &RelayLink,
    events: &mut broadcast::Receiver<DocEvent>,
    incoming: &mut broadcast::Receiver<RelayMessage>,
) -> Forwarded {
    let name = doc.name();
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => {
                    if !push(doc, link, &event).await {
                        return Forwarded::Resync;
                    }
                }
                Err(RecvError::Lagged(_)) => return Forwarded::Resync,
                Err(RecvError::Closed) => return Forwarded::Destroyed,
            },
            message = incoming.recv() => match message {
                Ok(message) => {
                    if message.sender == link.replica {
                        continue;
                    }
                    if let Err(e) = doc.apply(&message.update, Origin::Relay) {
                        warn!(document = %name, error = %e, "Skipping unreadable relay update");
                    }
                }
                Err(RecvError::Lagged(_)) => return Forwarded::Resync,
                Err(RecvError::Closed) => {
                    *incoming = link.relay.subscribe(name);
                    return Forwarded::Resync;
                }
            },
            _ = doc.destroyed() => {
                while let Ok(event) = events.try_recv() {
                    push(doc, link, &event).await;
                }
                return Forwarded::Destroyed;
            }
        }
    }
}

/// Push a non-relay update. Returns false if the relay could not take it.
async fn push<D: Replicated>(doc: &SharedDoc<D>, link: &RelayLink, event: &DocEvent) -> bool {
    if event.origin == Origin::Relay {
        return true;
    }
    match link
        .relay
        .push(doc.name(), &link.token, &link.replica, event.update.to_vec())
        .await
    {
        Ok(()) => true,
        Err(RelayError::Offline) => {
            link.status.set_connection(ConnectionStatus::Offline);
            false
        }
        Err(e) => {
            warn!(document = %doc.name(), error = %e, "Relay push failed");
            false
        }
    }
}

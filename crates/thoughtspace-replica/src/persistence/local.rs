//! Local persistence adapter.

use super::store::LocalStore;
use super::SyncState;
use crate::error::PersistenceError;
use crate::name::DocumentName;
use crate::shared::{DocEvent, Origin, SharedDoc};
use std::sync::Arc;
use thoughtspace_crdt::Replicated;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Loads a document from the local store and keeps storing the updates it
/// receives from the relay.
///
/// Local writes are not stored by the adapter; the writer appends them
/// through [`LocalPersistence::persist`] so it can await durability.
pub struct LocalPersistence {
    name: DocumentName,
    store: Arc<dyn LocalStore>,
    state: watch::Receiver<SyncState>,
    closed: watch::Receiver<bool>,
}

impl LocalPersistence {
    pub fn open<D: Replicated>(doc: SharedDoc<D>, store: Arc<dyn LocalStore>) -> Self {
        let name = doc.name().clone();
        let (state_tx, state) = watch::channel(SyncState::Pending);
        let (closed_tx, closed) = watch::channel(false);
        // subscribe before loading so nothing written meanwhile is missed
        let events = doc.subscribe();
        tokio::spawn(run(doc, store.clone(), events, state_tx, closed_tx));

        Self {
            name,
            store,
            state,
            closed,
        }
    }

    pub fn name(&self) -> &DocumentName {
        &self.name
    }

    /// Resolves once the stored updates have been applied.
    pub async fn when_synced(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.clone();
        let result = match state.wait_for(|s| *s != SyncState::Pending).await {
            Ok(state) => match &*state {
                SyncState::Failed(e) => Err(e.clone()),
                _ => Ok(()),
            },
            Err(_) => Err(PersistenceError::Aborted(format!(
                "{} closed before loading",
                self.name
            ))),
        };
        result
    }

    pub fn is_synced(&self) -> bool {
        *self.state.borrow() == SyncState::Synced
    }

    /// Durably append a local update.
    pub async fn persist(&self, update: &[u8]) -> Result<(), PersistenceError> {
        self.store.append(&self.name, update.to_vec()).await
    }

    /// Remove all stored data for the document.
    pub async fn clear_data(&self) -> Result<(), PersistenceError> {
        self.store.clear(&self.name).await
    }

    /// Resolves once the adapter has stopped after the document was
    /// destroyed, with every queued update stored.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

async fn run<D: Replicated>(
    doc: SharedDoc<D>,
    store: Arc<dyn LocalStore>,
    mut events: broadcast::Receiver<DocEvent>,
    state: watch::Sender<SyncState>,
    closed: watch::Sender<bool>,
) {
    let name = doc.name().clone();
    match store.load(&name).await {
        Ok(updates) => {
            for update in &updates {
                if let Err(e) = doc.apply(update, Origin::LocalStore) {
                    warn!(document = %name, error = %e, "Skipping unreadable stored update");
                }
            }
            debug!(document = %name, updates = updates.len(), "Loaded from local store");
            state.send_replace(SyncState::Synced);
        }
        Err(e) => {
            state.send_replace(SyncState::Failed(e));
            closed.send_replace(true);
            return;
        }
    }

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => store_event(&*store, &name, &event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(document = %name, skipped, "Update stream lagged, storing full state");
                    match doc.encode_state() {
                        Ok(state) => append(&*store, &name, state).await,
                        Err(e) => error!(document = %name, error = %e, "Failed to encode state"),
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = doc.destroyed() => {
                while let Ok(event) = events.try_recv() {
                    store_event(&*store, &name, &event).await;
                }
                break;
            }
        }
    }
    closed.send_replace(true);
}

async fn store_event(store: &dyn LocalStore, name: &DocumentName, event: &DocEvent) {
    if event.origin == Origin::Relay {
        append(store, name, event.update.to_vec()).await;
    }
}

async fn append(store: &dyn LocalStore, name: &DocumentName, update: Vec<u8>) {
    if let Err(e) = store.append(name, update).await {
        error!(document = %name, error = %e, "Failed to store update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use serde_json::json;
    use thoughtspace_crdt::{Doc, ReplicaId};

    fn shared(name: &DocumentName, replica: &str) -> SharedDoc<Doc> {
        SharedDoc::new(name.clone(), Doc::new(name.to_string(), ReplicaId::new(replica)), 16)
    }

    #[tokio::test]
    async fn test_loads_stored_updates() {
        let store = Arc::new(MemoryStore::new());
        let name = DocumentName::lexeme("ts", "work");

        let writer = shared(&name, "r1");
        let local = LocalPersistence::open(writer.clone(), store.clone());
        local.when_synced().await.unwrap();
        let (_, update) = writer
            .transact(Origin::Writer(ReplicaId::new("r1")), |txn| {
                txn.set("lemma", json!("Work"))
            })
            .unwrap();
        local.persist(&update.unwrap()).await.unwrap();

        let reader = shared(&name, "r1");
        let reloaded = LocalPersistence::open(reader.clone(), store.clone());
        reloaded.when_synced().await.unwrap();
        assert!(reloaded.is_synced());
        assert_eq!(reader.read(|d| d.to_json()), writer.read(|d| d.to_json()));
        // the load itself is not stored again
        assert_eq!(store.update_count(&name), 1);
    }

    #[tokio::test]
    async fn test_relay_updates_are_stored_on_destroy() {
        let store = Arc::new(MemoryStore::new());
        let name = DocumentName::thought("ts", &"t1".into());

        let doc = shared(&name, "r1");
        let local = LocalPersistence::open(doc.clone(), store.clone());
        local.when_synced().await.unwrap();

        let mut remote = Doc::new(name.to_string(), ReplicaId::new("r2"));
        let (_, delta) = remote.transact(|txn| txn.set("value", json!("Work")));
        doc.apply(&delta.encode().unwrap(), Origin::Relay).unwrap();

        doc.destroy();
        local.closed().await;
        assert_eq!(store.update_count(&name), 1);
    }

    #[tokio::test]
    async fn test_load_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.inject_fault(PersistenceError::Io("disk".into()));
        let name = DocumentName::doclog("ts");

        let local = LocalPersistence::open(shared(&name, "r1"), store);
        assert_eq!(
            local.when_synced().await,
            Err(PersistenceError::Io("disk".into()))
        );
    }
}

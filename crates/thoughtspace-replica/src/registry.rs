//! Per-kind registry of live entity documents.
//!
//! The registry owns every document of one entity kind that is currently
//! loaded, together with the adapters attached to it. Documents are
//! created on demand, and loading the same id concurrently shares one
//! document.

use crate::config::ReplicaConfig;
use crate::document::EntityDocument;
use crate::entity::{EntityKind, Thought};
use crate::error::PersistenceError;
use crate::persistence::{LocalPersistence, LocalStore, RelayLink, RemotePersistence};
use crate::repair::RepairRequest;
use crate::shared::{Origin, SharedDoc};
use crate::status::{Alerts, ConnectionStatus, SyncStatus};
use crate::throttle::BatchThrottle;
use crate::view::StoreView;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thoughtspace_crdt::Doc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

/// Collaborators shared by both registries.
pub(crate) struct Context {
    pub config: ReplicaConfig,
    pub local: Arc<dyn LocalStore>,
    pub relay: Option<RelayLink>,
    pub status: SyncStatus,
    pub alerts: Alerts,
    pub throttle: BatchThrottle,
    pub view: Arc<dyn StoreView>,
    pub repairs: mpsc::UnboundedSender<RepairRequest>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    /// The caller needs the entity now. The document is registered and
    /// observed right away.
    Foreground,
    /// Replication pulling an entity the caller may not care about. The
    /// document is kept only if the store shows it.
    Background,
}

struct DocumentHandle {
    doc: SharedDoc<Doc>,
    local: LocalPersistence,
    remote: Option<RemotePersistence>,
    observer: Mutex<Option<AbortHandle>>,
}

impl DocumentHandle {
    fn destroy(&self) {
        self.doc.destroy();
        if let Some(observer) = self.observer.lock().take() {
            observer.abort();
        }
    }

    /// Destroy and wait until relay data received so far is stored.
    async fn close(&self) {
        self.destroy();
        self.local.closed().await;
    }
}

impl Drop for DocumentHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

pub struct Registry<E: EntityDocument> {
    ctx: Arc<Context>,
    arena: Mutex<HashMap<E::Id, Arc<DocumentHandle>>>,
}

impl<E: EntityDocument> Registry<E> {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            arena: Mutex::new(HashMap::new()),
        }
    }

    /// Current value of a registered document. Never touches storage.
    pub fn get(&self, id: &E::Id) -> Option<E> {
        let handle = self.arena.lock().get(id).cloned()?;
        handle.doc.read(|doc| E::read(id, doc))
    }

    pub fn contains(&self, id: &E::Id) -> bool {
        self.arena.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<E::Id> {
        self.arena.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.arena.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.lock().is_empty()
    }

    pub fn load(&self, id: E::Id, mode: LoadMode) -> BoxFuture<'_, Option<E>> {
        self.load_with(id, mode, self.ctx.config.remote)
    }

    /// Load an entity. With `remote` false the relay is never contacted
    /// for a newly opened document.
    pub fn load_with(&self, id: E::Id, mode: LoadMode, remote: bool) -> BoxFuture<'_, Option<E>> {
        Box::pin(async move {
            let existing = self.arena.lock().get(&id).cloned();
            let (handle, registered) = match (existing, mode) {
                (Some(handle), _) => (handle, true),
                (None, LoadMode::Foreground) => (self.register(&id, remote), true),
                (None, LoadMode::Background) => (Arc::new(self.open(&id, remote)), false),
            };

            match handle.local.when_synced().await {
                Ok(()) => {}
                Err(e) if e.is_abort() => {
                    warn!(kind = %E::KIND, id = %id, error = %e, "Load aborted, retrying");
                    self.release(&id, &handle);
                    tokio::time::sleep(self.ctx.config.retry_delay).await;
                    return self.load_with(id, mode, remote).await;
                }
                Err(e) => {
                    error!(
                        kind = %E::KIND,
                        id = %id,
                        error = %e,
                        "Failed to load from local store"
                    );
                    self.ctx
                        .alerts
                        .alert(format!("Error loading {} {}: {}", E::KIND, id, e));
                    if !registered {
                        handle.close().await;
                        return None;
                    }
                }
            }

            if mode == LoadMode::Foreground {
                let value = handle.doc.read(|doc| E::read(&id, doc));
                match &value {
                    Some(value) if value.is_populated_root() => self.hint_reconnecting(),
                    Some(_) => {}
                    None => {
                        if let Some(remote) = &handle.remote {
                            self.wait_remote(remote).await;
                        }
                    }
                }
                self.request_repair(&id, &handle);
                return handle.doc.read(|doc| E::read(&id, doc));
            }

            if let Some(remote) = &handle.remote {
                self.wait_remote(remote).await;
            }
            let value = handle.doc.read(|doc| E::read(&id, doc));
            if registered {
                self.request_repair(&id, &handle);
                return value;
            }

            let loaded = value
                .as_ref()
                .is_some_and(|value| value.is_loaded(&id, &*self.ctx.view));
            if !loaded {
                handle.close().await;
                return value;
            }

            let adopted = {
                let mut arena = self.arena.lock();
                if arena.contains_key(&id) {
                    false
                } else {
                    arena.insert(id.clone(), handle.clone());
                    true
                }
            };
            if adopted {
                debug!(kind = %E::KIND, id = %id, "Replicated into the store");
                self.observe(&id, &handle);
                self.ctx.throttle.push(E::notification(&id, value.clone()));
                self.request_repair(&id, &handle);
            } else {
                handle.close().await;
            }
            value
        })
    }

    /// Write `value`. `previous` is the writer's last known value, used to
    /// compute removals. A document that was never loaded is loaded from
    /// the local store first so the write cannot mask stored data.
    pub fn update(&self, id: E::Id, value: E, previous: Option<E>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let handle = self.register(&id, self.ctx.config.remote);
            match handle.local.when_synced().await {
                Ok(()) => {}
                Err(e) if e.is_abort() => {
                    warn!(kind = %E::KIND, id = %id, error = %e, "Save aborted, retrying");
                    self.release(&id, &handle);
                    tokio::time::sleep(self.ctx.config.retry_delay).await;
                    return self.update(id, value, previous).await;
                }
                Err(e) => {
                    self.ctx
                        .alerts
                        .alert(format!("Error saving {} {}: {}", E::KIND, id, e));
                    return;
                }
            }

            let pending = previous.is_none() && handle.doc.read(|doc| !doc.is_empty());
            let origin = Origin::Writer(self.ctx.config.replica_id.clone());
            let update = match handle
                .doc
                .transact(origin, |txn| value.write(txn, previous.as_ref()))
            {
                Ok((_, update)) => update,
                Err(e) => {
                    error!(kind = %E::KIND, id = %id, error = %e, "Failed to encode update");
                    self.ctx
                        .alerts
                        .alert(format!("Error saving {} {}: {}", E::KIND, id, e));
                    return;
                }
            };

            // the store only knew its own value; give it the merged one
            if pending && E::KIND == EntityKind::Lexeme {
                let merged = handle.doc.read(|doc| E::read(&id, doc));
                if merged.is_some() {
                    self.ctx.throttle.push(E::notification(&id, merged));
                }
            }

            if let Some(update) = update {
                self.persist(&id, &handle, &update).await;
            }
        })
    }

    async fn persist(&self, id: &E::Id, handle: &DocumentHandle, update: &[u8]) {
        loop {
            match handle.local.persist(update).await {
                Ok(()) => return,
                Err(e) if e.is_abort() => {
                    warn!(kind = %E::KIND, id = %id, error = %e, "Save aborted, retrying");
                    tokio::time::sleep(self.ctx.config.retry_delay).await;
                }
                Err(e) => {
                    error!(kind = %E::KIND, id = %id, error = %e, "Failed to save");
                    self.ctx
                        .alerts
                        .alert(format!("Error saving {} {}: {}", E::KIND, id, e));
                    return;
                }
            }
        }
    }

    /// Drop the document from memory and clear its stored data. Works
    /// whether or not the document was ever loaded.
    pub async fn delete(&self, id: &E::Id) {
        let handle = self.arena.lock().remove(id);
        if let Some(handle) = &handle {
            handle.close().await;
        }

        let name = E::document_name(&self.ctx.config.tsid, id);
        loop {
            let result = match &handle {
                Some(handle) => handle.local.clear_data().await,
                None => self.ctx.local.clear(&name).await,
            };
            match result {
                Ok(()) => {
                    debug!(document = %name, "Deleted");
                    return;
                }
                Err(PersistenceError::NotFound(_)) => return,
                Err(e) if e.is_abort() => {
                    warn!(document = %name, error = %e, "Delete aborted, retrying");
                    tokio::time::sleep(self.ctx.config.retry_delay).await;
                }
                Err(e) => {
                    error!(document = %name, error = %e, "Failed to delete");
                    self.ctx
                        .alerts
                        .alert(format!("Error deleting {} {}: {}", E::KIND, id, e));
                    return;
                }
            }
        }
    }

    /// Drop the document from memory, keeping stored data.
    pub fn free(&self, id: &E::Id) {
        if let Some(handle) = self.arena.lock().remove(id) {
            handle.destroy();
        }
    }

    fn release(&self, id: &E::Id, handle: &Arc<DocumentHandle>) {
        let mut arena = self.arena.lock();
        if arena.get(id).is_some_and(|current| Arc::ptr_eq(current, handle)) {
            arena.remove(id);
        }
        drop(arena);
        handle.destroy();
    }

    fn register(&self, id: &E::Id, remote: bool) -> Arc<DocumentHandle> {
        let mut arena = self.arena.lock();
        if let Some(handle) = arena.get(id) {
            return handle.clone();
        }
        let handle = Arc::new(self.open(id, remote));
        self.observe(id, &handle);
        arena.insert(id.clone(), handle.clone());
        handle
    }

    fn open(&self, id: &E::Id, remote: bool) -> DocumentHandle {
        let name = E::document_name(&self.ctx.config.tsid, id);
        let doc = SharedDoc::new(
            name.clone(),
            Doc::new(name.to_string(), self.ctx.config.replica_id.clone()),
            self.ctx.config.event_capacity,
        );
        let local = LocalPersistence::open(doc.clone(), self.ctx.local.clone());
        let remote = match (&self.ctx.relay, remote) {
            (Some(link), true) => Some(RemotePersistence::open(doc.clone(), link.clone())),
            _ => None,
        };
        DocumentHandle {
            doc,
            local,
            remote,
            observer: Mutex::new(None),
        }
    }

    /// Forward changes made by anyone but this replica to the store.
    fn observe(&self, id: &E::Id, handle: &DocumentHandle) {
        let mut events = handle.doc.subscribe();
        let doc = handle.doc.clone();
        let id = id.clone();
        let throttle = self.ctx.throttle.clone();
        let writer = Origin::Writer(self.ctx.config.replica_id.clone());

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) if event.origin == writer => {}
                        Ok(_) | Err(RecvError::Lagged(_)) => {
                            if let Some(value) = doc.read(|d| E::read(&id, d)) {
                                throttle.push(E::notification(&id, Some(value)));
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = doc.destroyed() => break,
                }
            }
        });
        *handle.observer.lock() = Some(task.abort_handle());
    }

    async fn wait_remote(&self, remote: &RemotePersistence) {
        if self.ctx.status.is_offline() {
            return;
        }
        tokio::select! {
            _ = remote.when_synced() => {}
            _ = self.ctx.status.offline() => {
                debug!(document = %remote.name(), "Offline, using local data");
            }
        }
    }

    fn hint_reconnecting(&self) {
        if matches!(
            self.ctx.status.connection(),
            ConnectionStatus::Preconnecting | ConnectionStatus::Connecting
        ) {
            self.ctx.status.set_connection(ConnectionStatus::Reconnecting);
        }
    }

    /// Once the relay has delivered its data, ask for a structural check.
    fn request_repair(&self, id: &E::Id, handle: &Arc<DocumentHandle>) {
        let Some(target) = E::repair_target(id) else {
            return;
        };
        if handle.remote.is_none() {
            return;
        }
        let handle = handle.clone();
        let repairs = self.ctx.repairs.clone();
        tokio::spawn(async move {
            if let Some(remote) = &handle.remote {
                tokio::select! {
                    _ = remote.when_synced() => {}
                    _ = handle.doc.destroyed() => return,
                }
            }
            let thought = handle.doc.read(|doc| Thought::read(&target, doc));
            let _ = repairs.send(RepairRequest { id: target, thought });
        });
    }
}

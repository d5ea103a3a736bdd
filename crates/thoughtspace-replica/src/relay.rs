//! In-memory relay and the relay-side doclog sweeper.

use crate::doclog::{Doclog, DoclogAction};
use crate::entity::{EntityKind, ThoughtId};
use crate::error::{RelayError, Result};
use crate::name::DocumentName;
use crate::persistence::{MetaStore, Relay, RelayMessage};
use crate::replication::{DoclogHandler, ReplicationController, ReplicationOptions};
use crate::shared::{Origin, SharedDoc};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thoughtspace_crdt::ReplicaId;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct RelayDocument {
    updates: Vec<Arc<Vec<u8>>>,
    tx: broadcast::Sender<RelayMessage>,
}

/// Relay for testing and simulation. The first token used for a
/// thoughtspace becomes its owner; other tokens are rejected.
pub struct MemoryRelay {
    docs: RwLock<HashMap<String, RelayDocument>>,
    owners: RwLock<HashMap<String, String>>,
    online: AtomicBool,
    capacity: usize,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            capacity: 1024,
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Whether the relay holds any data for the document.
    pub fn contains(&self, name: &DocumentName) -> bool {
        self.update_count(name) > 0
    }

    pub fn update_count(&self, name: &DocumentName) -> usize {
        self.docs
            .read()
            .get(&name.to_string())
            .map_or(0, |doc| doc.updates.len())
    }

    pub fn document_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .docs
            .read()
            .iter()
            .filter(|(_, doc)| !doc.updates.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every update stored for the document.
    pub fn updates(&self, name: &DocumentName) -> Vec<Vec<u8>> {
        self.docs
            .read()
            .get(&name.to_string())
            .map(|doc| doc.updates.iter().map(|u| u.to_vec()).collect())
            .unwrap_or_default()
    }

    /// Drop stored data for the document. Live subscribers stay attached.
    pub fn clear_document(&self, name: &DocumentName) -> bool {
        match self.docs.write().get_mut(&name.to_string()) {
            Some(doc) if !doc.updates.is_empty() => {
                doc.updates.clear();
                true
            }
            _ => false,
        }
    }

    fn check(&self, name: &DocumentName, token: &str) -> std::result::Result<(), RelayError> {
        if !self.is_online() {
            return Err(RelayError::Offline);
        }
        let mut owners = self.owners.write();
        let owner = owners
            .entry(name.tsid().to_string())
            .or_insert_with(|| token.to_string());
        if owner.as_str() == token {
            Ok(())
        } else {
            Err(RelayError::Unauthorized(name.tsid().to_string()))
        }
    }

    fn store(&self, name: &DocumentName, sender: &ReplicaId, update: Vec<u8>) {
        let mut docs = self.docs.write();
        let doc = self.document(&mut docs, name);
        let update = Arc::new(update);
        doc.updates.push(update.clone());
        let _ = doc.tx.send(RelayMessage {
            sender: sender.clone(),
            update,
        });
    }

    fn document<'a>(
        &self,
        docs: &'a mut HashMap<String, RelayDocument>,
        name: &DocumentName,
    ) -> &'a mut RelayDocument {
        docs.entry(name.to_string()).or_insert_with(|| RelayDocument {
            updates: Vec::new(),
            tx: broadcast::channel(self.capacity).0,
        })
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn sync(
        &self,
        name: &DocumentName,
        token: &str,
        sender: &ReplicaId,
        state: Option<Vec<u8>>,
    ) -> std::result::Result<Vec<Vec<u8>>, RelayError> {
        self.check(name, token)?;
        let existing = self.updates(name);
        if let Some(state) = state {
            self.store(name, sender, state);
        }
        Ok(existing)
    }

    async fn push(
        &self,
        name: &DocumentName,
        token: &str,
        sender: &ReplicaId,
        update: Vec<u8>,
    ) -> std::result::Result<(), RelayError> {
        self.check(name, token)?;
        self.store(name, sender, update);
        Ok(())
    }

    fn subscribe(&self, name: &DocumentName) -> broadcast::Receiver<RelayMessage> {
        let mut docs = self.docs.write();
        self.document(&mut docs, name).tx.subscribe()
    }
}

/// Runs on the relay: follows a thoughtspace's doclog and clears the
/// relay's copy of every document it deletes.
pub struct DoclogSweeper {
    controller: ReplicationController,
    follower: JoinHandle<()>,
}

impl DoclogSweeper {
    pub fn spawn(relay: Arc<MemoryRelay>, tsid: &str, meta: Arc<dyn MetaStore>) -> Self {
        let name = DocumentName::doclog(tsid);
        let doclog = SharedDoc::new(
            name.clone(),
            Doclog::new(name.to_string(), ReplicaId::new("relay")),
            relay.capacity,
        );

        let mut incoming = relay.subscribe(&name);
        load(&doclog, &relay);
        let follower = {
            let doclog = doclog.clone();
            let relay = relay.clone();
            tokio::spawn(async move {
                loop {
                    match incoming.recv().await {
                        Ok(message) => {
                            if let Err(e) = doclog.apply(&message.update, Origin::Relay) {
                                warn!(error = %e, "Skipping unreadable doclog update");
                            }
                        }
                        Err(RecvError::Lagged(_)) => load(&doclog, &relay),
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        let handler = Arc::new(RelayDeletions {
            relay,
            tsid: tsid.to_string(),
        });
        let controller = ReplicationController::spawn(
            doclog,
            meta,
            handler,
            ReplicationOptions::new().autostart(true),
        );
        info!(tsid = %tsid, "Doclog sweeper started");

        Self {
            controller,
            follower,
        }
    }

    pub fn controller(&self) -> &ReplicationController {
        &self.controller
    }
}

impl Drop for DoclogSweeper {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

fn load(doclog: &SharedDoc<Doclog>, relay: &MemoryRelay) {
    for update in relay.updates(doclog.name()) {
        if let Err(e) = doclog.apply(&update, Origin::Relay) {
            warn!(error = %e, "Skipping unreadable doclog update");
        }
    }
}

struct RelayDeletions {
    relay: Arc<MemoryRelay>,
    tsid: String,
}

#[async_trait]
impl DoclogHandler for RelayDeletions {
    async fn next(&self, kind: EntityKind, id: &str, action: DoclogAction) -> Result<()> {
        if action != DoclogAction::Delete {
            return Ok(());
        }
        let name = match kind {
            EntityKind::Thought => DocumentName::thought(self.tsid.as_str(), &ThoughtId::new(id)),
            EntityKind::Lexeme => DocumentName::lexeme(self.tsid.as_str(), id),
        };
        if self.relay.clear_document(&name) {
            debug!(document = %name, "Cleared deleted document from relay");
        }
        Ok(())
    }
}

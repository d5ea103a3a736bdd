//! A replicated document shared between the engine and its persistence
//! adapters.
//!
//! Every change is broadcast as encoded update bytes tagged with its
//! [`Origin`], so each adapter can skip the changes it produced itself.

use crate::error::Result;
use crate::name::DocumentName;
use parking_lot::Mutex;
use std::sync::Arc;
use thoughtspace_crdt::{Doc, ReplicaId, Replicated, Transaction};
use tokio::sync::{broadcast, watch};

/// Where a change came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    /// A local transaction by this replica.
    Writer(ReplicaId),
    /// Data read back from the local store.
    LocalStore,
    /// Data received from the relay.
    Relay,
}

#[derive(Clone, Debug)]
pub struct DocEvent {
    pub origin: Origin,
    pub update: Arc<Vec<u8>>,
}

struct SharedInner<D> {
    name: DocumentName,
    doc: Mutex<D>,
    events: broadcast::Sender<DocEvent>,
    destroyed: watch::Sender<bool>,
}

pub struct SharedDoc<D> {
    inner: Arc<SharedInner<D>>,
}

impl<D> Clone for SharedDoc<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Replicated> SharedDoc<D> {
    pub fn new(name: DocumentName, doc: D, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (destroyed, _) = watch::channel(false);
        Self {
            inner: Arc::new(SharedInner {
                name,
                doc: Mutex::new(doc),
                events,
                destroyed,
            }),
        }
    }

    pub fn name(&self) -> &DocumentName {
        &self.inner.name
    }

    pub fn read<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.inner.doc.lock())
    }

    /// Encoded full state.
    pub fn encode_state(&self) -> Result<Vec<u8>> {
        Ok(self.inner.doc.lock().encode_state()?)
    }

    /// Join encoded update bytes. The update is rebroadcast only if it
    /// changed the document.
    pub fn apply(&self, update: &[u8], origin: Origin) -> Result<bool> {
        let doc = &mut *self.inner.doc.lock();
        let changed = doc.apply_encoded(update)?;
        if changed {
            let _ = self.inner.events.send(DocEvent {
                origin,
                update: Arc::new(update.to_vec()),
            });
        }
        Ok(changed)
    }

    /// Run a local mutation. `f` returns its result and the encoded update
    /// it produced, if any; the update is broadcast and handed back.
    pub fn mutate<R>(
        &self,
        origin: Origin,
        f: impl FnOnce(&mut D) -> Result<(R, Option<Vec<u8>>)>,
    ) -> Result<(R, Option<Arc<Vec<u8>>>)> {
        let doc = &mut *self.inner.doc.lock();
        let (result, update) = f(doc)?;
        let update = update.map(Arc::new);
        if let Some(update) = &update {
            let _ = self.inner.events.send(DocEvent {
                origin,
                update: update.clone(),
            });
        }
        Ok((result, update))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocEvent> {
        self.inner.events.subscribe()
    }

    /// Signal every adapter and observer attached to this document to stop.
    pub fn destroy(&self) {
        self.inner.destroyed.send_replace(true);
    }

    pub fn is_destroyed(&self) -> bool {
        *self.inner.destroyed.borrow()
    }

    /// Resolves once the document is destroyed.
    pub async fn destroyed(&self) {
        let mut rx = self.inner.destroyed.subscribe();
        if rx.wait_for(|destroyed| *destroyed).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl SharedDoc<Doc> {
    /// Run a document transaction. Empty deltas are neither broadcast nor
    /// returned.
    pub fn transact<R>(
        &self,
        origin: Origin,
        f: impl FnOnce(&mut Transaction<'_>) -> R,
    ) -> Result<(R, Option<Arc<Vec<u8>>>)> {
        self.mutate(origin, |doc| {
            let (result, delta) = doc.transact(f);
            if delta.is_empty() {
                Ok((result, None))
            } else {
                Ok((result, Some(delta.encode()?)))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared(replica: &str) -> SharedDoc<Doc> {
        let name = DocumentName::lexeme("ts", "work");
        SharedDoc::new(name.clone(), Doc::new(name.to_string(), ReplicaId::new(replica)), 16)
    }

    #[tokio::test]
    async fn test_transact_broadcasts_update() {
        let doc = shared("r1");
        let mut events = doc.subscribe();

        let origin = Origin::Writer(ReplicaId::new("r1"));
        let (_, update) = doc
            .transact(origin.clone(), |txn| txn.set("lemma", json!("Work")))
            .unwrap();
        assert!(update.is_some());

        let event = events.recv().await.unwrap();
        assert_eq!(event.origin, origin);

        let other = shared("r2");
        assert!(other.apply(&event.update, Origin::Relay).unwrap());
        assert_eq!(other.read(|d| d.to_json()), doc.read(|d| d.to_json()));
    }

    #[tokio::test]
    async fn test_noop_apply_is_not_broadcast() {
        let doc = shared("r1");
        let (_, update) = doc
            .transact(Origin::Writer(ReplicaId::new("r1")), |txn| {
                txn.set("lemma", json!("Work"))
            })
            .unwrap();

        let mut events = doc.subscribe();
        assert!(!doc.apply(&update.unwrap(), Origin::Relay).unwrap());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy() {
        let doc = shared("r1");
        assert!(!doc.is_destroyed());
        doc.destroy();
        assert!(doc.is_destroyed());
        doc.destroyed().await;
    }
}

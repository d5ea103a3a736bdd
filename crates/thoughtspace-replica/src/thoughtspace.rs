//! The replication engine of one thoughtspace.
//!
//! [`Thoughtspace`] ties the entity registries, the doclog and its
//! replication controller, the save queue and the repair worker together.
//! Writes go through [`Thoughtspace::update_thoughts`]; changes made by
//! other replicas come out of [`Thoughtspace::take_updates`] as throttled
//! [`UpdateBatch`]es.

use crate::batch::UpdateBatch;
use crate::config::ReplicaConfig;
use crate::doclog::{Doclog, DoclogAction, DoclogEntry};
use crate::entity::{Entity, EntityKind, Lexeme, Thought, ThoughtId};
use crate::error::{ReplicaError, Result};
use crate::name::DocumentName;
use crate::persistence::{
    LocalPersistence, LocalStore, MemoryStore, MetaStore, Relay, RelayLink, RemotePersistence,
};
use crate::registry::{Context, LoadMode, Registry};
use crate::repair;
use crate::replication::{DoclogHandler, ReplicationController, ReplicationOptions};
use crate::shared::SharedDoc;
use crate::status::{Alerts, ConnectionStatus, SyncStatus};
use crate::task_queue::{TaskQueue, TaskQueueBuilder};
use crate::throttle::BatchThrottle;
use crate::view::StoreView;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type SaveTask = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Storage backends of a thoughtspace.
#[derive(Clone)]
pub struct Stores {
    pub local: Arc<dyn LocalStore>,
    pub meta: Arc<dyn MetaStore>,
    /// Without a relay the thoughtspace is local-only.
    pub relay: Option<Arc<dyn Relay>>,
}

impl Stores {
    /// Document and metadata storage in one in-memory store.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            local: store.clone(),
            meta: store,
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relay = Some(relay);
        self
    }
}

pub(crate) struct Inner {
    pub(crate) ctx: Arc<Context>,
    pub(crate) thoughts: Registry<Thought>,
    pub(crate) lexemes: Registry<Lexeme>,
    replication: ReplicationController,
    doclog_local: LocalPersistence,
    doclog_remote: Option<RemotePersistence>,
    save_queue: TaskQueue,
    ready: AtomicBool,
    updates: Mutex<Option<mpsc::UnboundedReceiver<UpdateBatch>>>,
    repair_worker: JoinHandle<()>,
}

/// Handle to an open thoughtspace. Cloning is cheap.
#[derive(Clone)]
pub struct Thoughtspace {
    inner: Arc<Inner>,
}

impl Thoughtspace {
    /// Open a thoughtspace. Replication of other replicas' changes stays
    /// paused until [`Thoughtspace::start_replication`].
    pub fn open(config: ReplicaConfig, stores: Stores, view: Arc<dyn StoreView>) -> Self {
        let inner = Arc::new_cyclic(|engine: &Weak<Inner>| {
            let status = SyncStatus::new();
            let (throttle, updates) = BatchThrottle::new(config.throttle_window);
            let (repairs, repair_requests) = mpsc::unbounded_channel();

            let relay = match (stores.relay, config.remote) {
                (Some(relay), true) => Some(RelayLink {
                    relay,
                    token: config.access_token.clone(),
                    replica: config.replica_id.clone(),
                    status: status.clone(),
                    retry_delay: config.retry_delay,
                }),
                _ => {
                    status.set_connection(ConnectionStatus::Offline);
                    None
                }
            };

            let name = DocumentName::doclog(config.tsid.as_str());
            let doclog = SharedDoc::new(
                name.clone(),
                Doclog::new(name.to_string(), config.replica_id.clone()),
                config.event_capacity,
            );
            let doclog_local = LocalPersistence::open(doclog.clone(), stores.local.clone());
            let doclog_remote = relay
                .clone()
                .map(|link| RemotePersistence::open(doclog.clone(), link));

            let replication = {
                let step_status = status.clone();
                let end_status = status.clone();
                ReplicationController::spawn(
                    doclog,
                    stores.meta,
                    Arc::new(EngineHandler {
                        engine: engine.clone(),
                    }),
                    ReplicationOptions::new()
                        .on_step(move |progress| {
                            step_status.set_replication_progress(progress.ratio())
                        })
                        .on_end(move || end_status.set_replication_progress(1.0)),
                )
            };

            let save_queue = {
                let step_engine = engine.clone();
                let engine = engine.clone();
                TaskQueueBuilder::new(config.save_concurrency)
                    .on_step(move |progress| {
                        if let Some(engine) = step_engine.upgrade() {
                            engine.ctx.status.set_saving_progress(progress.ratio());
                            engine.refresh_gate();
                        }
                    })
                    .on_end(move || {
                        if let Some(engine) = engine.upgrade() {
                            engine.ctx.status.set_saving_progress(1.0);
                            engine.refresh_gate();
                        }
                    })
                    .build()
            };

            info!(
                tsid = %config.tsid,
                replica = %config.replica_id,
                remote = relay.is_some(),
                "Opening thoughtspace"
            );

            let ctx = Arc::new(Context {
                config,
                local: stores.local,
                relay,
                status,
                alerts: Alerts::new(),
                throttle,
                view,
                repairs,
            });

            Inner {
                thoughts: Registry::new(ctx.clone()),
                lexemes: Registry::new(ctx.clone()),
                ctx,
                replication,
                doclog_local,
                doclog_remote,
                save_queue,
                ready: AtomicBool::new(false),
                updates: Mutex::new(Some(updates)),
                repair_worker: repair::spawn(engine.clone(), repair_requests),
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.inner.ctx.config
    }

    pub fn status(&self) -> &SyncStatus {
        &self.inner.ctx.status
    }

    /// Throttled change notifications for the application store. Can be
    /// taken once.
    pub fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<UpdateBatch>> {
        self.inner.updates.lock().take()
    }

    /// User-facing error messages. Can be taken once.
    pub fn take_alerts(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.inner.ctx.alerts.take_receiver()
    }

    pub fn replication(&self) -> &ReplicationController {
        &self.inner.replication
    }

    pub fn thoughts(&self) -> &Registry<Thought> {
        &self.inner.thoughts
    }

    pub fn lexemes(&self) -> &Registry<Lexeme> {
        &self.inner.lexemes
    }

    /// Resolves once the doclog has been loaded from the local store and,
    /// unless offline, exchanged with the relay.
    pub async fn when_synced(&self) {
        if let Err(e) = self.inner.doclog_local.when_synced().await {
            error!(error = %e, "Failed to load doclog");
        }
        if let Some(remote) = &self.inner.doclog_remote {
            let status = &self.inner.ctx.status;
            if !status.is_offline() {
                tokio::select! {
                    _ = remote.when_synced() => {}
                    _ = status.offline() => {}
                }
            }
        }
    }

    pub async fn get_thought_by_id(&self, id: &ThoughtId) -> Option<Thought> {
        self.inner.thoughts.load(id.clone(), LoadMode::Foreground).await
    }

    pub async fn get_thoughts_by_ids(&self, ids: &[ThoughtId]) -> Vec<Option<Thought>> {
        join_all(ids.iter().map(|id| self.get_thought_by_id(id))).await
    }

    pub async fn get_lexeme_by_id(&self, key: &str) -> Option<Lexeme> {
        self.inner
            .lexemes
            .load(key.to_string(), LoadMode::Foreground)
            .await
    }

    pub async fn get_lexemes_by_ids(&self, keys: &[String]) -> Vec<Option<Lexeme>> {
        join_all(keys.iter().map(|key| self.get_lexeme_by_id(key))).await
    }

    pub async fn get_by_id(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        match kind {
            EntityKind::Thought => self
                .get_thought_by_id(&ThoughtId::new(id))
                .await
                .map(Entity::Thought),
            EntityKind::Lexeme => self.get_lexeme_by_id(id).await.map(Entity::Lexeme),
        }
    }

    /// Load a Thought and all of its descendants in the background, calling
    /// `on_thought` for each one as it arrives. With `remote` false only the
    /// local store is read. Thoughts the store does not show are not kept
    /// in memory.
    pub fn replicate_tree(
        &self,
        id: &ThoughtId,
        remote: bool,
        on_thought: impl Fn(&Thought) + Send + Sync + 'static,
    ) -> ReplicateTree {
        let tree = ReplicateTree {
            queue: TaskQueue::new(self.inner.ctx.config.subtree_concurrency),
            cancelled: Arc::new(AtomicBool::new(false)),
            thoughts: Arc::new(Mutex::new(BTreeMap::new())),
        };
        let walk = SubtreeWalk {
            engine: self.inner.clone(),
            queue: tree.queue.clone(),
            cancelled: tree.cancelled.clone(),
            thoughts: tree.thoughts.clone(),
            remote,
            on_thought: Arc::new(on_thought),
        };
        let id = id.clone();
        drop(tree.queue.add([move || walk.visit(id)]));
        tree
    }

    /// Save a batch of changes and log them for other replicas.
    pub async fn update_thoughts(&self, batch: UpdateBatch) -> Result<()> {
        self.inner.update_thoughts(batch).await
    }

    /// Delete a Lexeme. Its contexts are emptied first so replicas that
    /// still hold the document see no stale contexts.
    pub async fn delete_lexeme(&self, key: &str) {
        self.inner.delete_lexeme(&key.to_string(), true).await
    }

    /// Delete every loaded entity and write the initial Thoughts.
    pub async fn clear(&self) -> Result<()> {
        let inner = &self.inner;
        let thoughts = inner.thoughts.ids();
        let lexemes = inner.lexemes.ids();
        join_all(thoughts.iter().map(|id| inner.thoughts.delete(id))).await;
        join_all(lexemes.iter().map(|key| inner.lexemes.delete(key))).await;
        debug!(thoughts = thoughts.len(), lexemes = lexemes.len(), "Cleared thoughtspace");
        inner.update_thoughts(UpdateBatch::initial()).await
    }

    /// Drop a Thought from memory, keeping its stored data.
    pub fn free_thought(&self, id: &ThoughtId) {
        self.inner.thoughts.free(id)
    }

    pub fn free_lexeme(&self, key: &str) {
        self.inner.lexemes.free(&key.to_string())
    }

    /// Mark the application ready and let doclog replication run whenever
    /// nothing is being saved or pulled.
    pub fn start_replication(&self) {
        self.inner.ready.store(true, Ordering::SeqCst);
        self.inner.refresh_gate();
    }

    pub fn pause_replication(&self) {
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.replication.pause();
    }

    /// While the application pulls entities, replication is held back.
    pub fn set_pulling(&self, pulling: bool) {
        self.inner.ctx.status.set_pulling(pulling);
        self.inner.refresh_gate();
    }

    /// Resolves once every queued save has settled.
    pub async fn wait_saved(&self) {
        self.inner.save_queue.end().await
    }
}

impl Inner {
    fn refresh_gate(&self) {
        if !self.ready.load(Ordering::SeqCst) {
            return;
        }
        if self.save_queue.is_busy() || self.ctx.status.is_pulling() {
            self.replication.pause();
        } else {
            self.replication.start();
        }
    }

    pub(crate) async fn update_thoughts(self: &Arc<Self>, batch: UpdateBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.ready.load(Ordering::SeqCst) {
            self.replication.pause();
        }

        let UpdateBatch {
            thoughts,
            lexemes,
            mut lexemes_old,
        } = batch;
        let mut thought_log = Vec::new();
        let mut lexeme_log = Vec::new();
        let mut saves: Vec<SaveTask> = Vec::new();
        let mut deletes: Vec<SaveTask> = Vec::new();

        for (id, thought) in thoughts {
            let engine = self.clone();
            match thought {
                Some(thought) => {
                    thought_log.push(DoclogEntry::new(id.as_str(), DoclogAction::Update));
                    saves.push(Box::new(move || {
                        async move {
                            engine.thoughts.update(id, thought, None).await;
                            Ok(())
                        }
                        .boxed()
                    }));
                }
                None => {
                    thought_log.push(DoclogEntry::new(id.as_str(), DoclogAction::Delete));
                    deletes.push(Box::new(move || {
                        async move {
                            engine.thoughts.delete(&id).await;
                            Ok(())
                        }
                        .boxed()
                    }));
                }
            }
        }

        for (key, lexeme) in lexemes {
            let engine = self.clone();
            match lexeme {
                Some(lexeme) => {
                    lexeme_log.push(DoclogEntry::new(key.as_str(), DoclogAction::Update));
                    let previous = lexemes_old.swap_remove(&key).flatten();
                    saves.push(Box::new(move || {
                        async move {
                            engine.lexemes.update(key, lexeme, previous).await;
                            Ok(())
                        }
                        .boxed()
                    }));
                }
                None => {
                    lexeme_log.push(DoclogEntry::new(key.as_str(), DoclogAction::Delete));
                    deletes.push(Box::new(move || {
                        async move {
                            engine.delete_lexeme(&key, true).await;
                            Ok(())
                        }
                        .boxed()
                    }));
                }
            }
        }

        // entries are logged once the updates are applied, so a replica
        // replaying them finds the data
        self.save_queue.add(saves).join().await?;
        self.log(&thought_log, &lexeme_log).await?;
        self.save_queue.add(deletes).join().await?;
        Ok(())
    }

    async fn log(&self, thoughts: &[DoclogEntry], lexemes: &[DoclogEntry]) -> Result<()> {
        let Some(update) = self
            .replication
            .log(&self.ctx.config.replica_id, thoughts, lexemes)?
        else {
            return Ok(());
        };
        loop {
            match self.doclog_local.persist(&update).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_abort() => {
                    warn!(error = %e, "Saving doclog aborted, retrying");
                    tokio::time::sleep(self.ctx.config.retry_delay).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to save doclog");
                    self.ctx.alerts.alert(format!("Error saving doclog: {e}"));
                    return Ok(());
                }
            }
        }
    }

    /// Empty the Lexeme's contexts, then delete it. With `load` false only
    /// a Lexeme already in memory is emptied.
    pub(crate) async fn delete_lexeme(&self, key: &String, load: bool) {
        let current = if load {
            self.lexemes.load(key.clone(), LoadMode::Foreground).await
        } else {
            self.lexemes.get(key)
        };
        if let Some(current) = current {
            let emptied = Lexeme {
                contexts: Vec::new(),
                ..current.clone()
            };
            self.lexemes.update(key.clone(), emptied, Some(current)).await;
        }
        self.lexemes.delete(key).await;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.repair_worker.abort();
        self.replication.doclog().destroy();
    }
}

/// Replays doclog entries written by any replica into this one.
struct EngineHandler {
    engine: Weak<Inner>,
}

#[async_trait]
impl DoclogHandler for EngineHandler {
    async fn next(&self, kind: EntityKind, id: &str, action: DoclogAction) -> Result<()> {
        let engine = self.engine.upgrade().ok_or(ReplicaError::Cancelled)?;
        match (kind, action) {
            (EntityKind::Thought, DoclogAction::Update) => {
                engine
                    .thoughts
                    .load(ThoughtId::new(id), LoadMode::Background)
                    .await;
            }
            (EntityKind::Thought, DoclogAction::Delete) => {
                let id = ThoughtId::new(id);
                engine
                    .ctx
                    .throttle
                    .push(UpdateBatch::new().delete_thought(id.clone()));
                engine.thoughts.delete(&id).await;
            }
            (EntityKind::Lexeme, DoclogAction::Update) => {
                engine
                    .lexemes
                    .load(id.to_string(), LoadMode::Background)
                    .await;
            }
            (EntityKind::Lexeme, DoclogAction::Delete) => {
                let key = id.to_string();
                engine
                    .ctx
                    .throttle
                    .push(UpdateBatch::new().delete_lexeme(key.clone()));
                engine.delete_lexeme(&key, false).await;
            }
        }
        Ok(())
    }
}

/// A running subtree replication.
pub struct ReplicateTree {
    queue: TaskQueue,
    cancelled: Arc<AtomicBool>,
    thoughts: Arc<Mutex<BTreeMap<ThoughtId, Thought>>>,
}

impl ReplicateTree {
    /// Stop loading. Thoughts already being loaded still finish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.queue.clear();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves with every Thought loaded so far once the subtree has been
    /// walked or the walk was cancelled.
    pub async fn finish(&self) -> BTreeMap<ThoughtId, Thought> {
        self.queue.end().await;
        self.thoughts.lock().clone()
    }
}

#[derive(Clone)]
struct SubtreeWalk {
    engine: Arc<Inner>,
    queue: TaskQueue,
    cancelled: Arc<AtomicBool>,
    thoughts: Arc<Mutex<BTreeMap<ThoughtId, Thought>>>,
    remote: bool,
    on_thought: Arc<dyn Fn(&Thought) + Send + Sync>,
}

impl SubtreeWalk {
    fn visit(self, id: ThoughtId) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }
            let thought = self
                .engine
                .thoughts
                .load_with(id.clone(), LoadMode::Background, self.remote)
                .await;
            let Some(thought) = thought else {
                debug!(id = %id, "Thought not found in subtree");
                return Ok(());
            };
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.thoughts.lock().insert(id, thought.clone());
            (self.on_thought)(&thought);

            let children: Vec<ThoughtId> = thought.children().cloned().collect();
            let tasks: Vec<_> = children
                .into_iter()
                .map(|child| {
                    let walk = self.clone();
                    move || walk.visit(child)
                })
                .collect();
            // awaited through the queue
            drop(self.queue.add(tasks));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaConfigBuilder;
    use crate::error::PersistenceError;
    use crate::view::MemoryView;
    use std::time::Duration;

    /// Local store that records which documents were written or cleared.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        ops: Mutex<Vec<String>>,
    }

    impl RecordingStore {
        fn ops_for(&self, name: &DocumentName) -> Vec<String> {
            let suffix = format!(" {}", name);
            self.ops
                .lock()
                .iter()
                .filter(|op| op.ends_with(&suffix))
                .map(|op| op.trim_end_matches(&suffix).to_string())
                .collect()
        }
    }

    #[async_trait]
    impl LocalStore for RecordingStore {
        async fn load(
            &self,
            name: &DocumentName,
        ) -> std::result::Result<Vec<Vec<u8>>, PersistenceError> {
            self.ops.lock().push(format!("load {}", name));
            self.inner.load(name).await
        }

        async fn append(
            &self,
            name: &DocumentName,
            update: Vec<u8>,
        ) -> std::result::Result<(), PersistenceError> {
            self.ops.lock().push(format!("append {}", name));
            self.inner.append(name, update).await
        }

        async fn clear(&self, name: &DocumentName) -> std::result::Result<(), PersistenceError> {
            self.ops.lock().push(format!("clear {}", name));
            self.inner.clear(name).await
        }
    }

    fn open(store: &Arc<RecordingStore>) -> Thoughtspace {
        let config = ReplicaConfigBuilder::new()
            .tsid("ts")
            .replica_id("device")
            .retry_delay(Duration::from_millis(20))
            .build();
        let stores = Stores {
            local: store.clone(),
            meta: Arc::new(MemoryStore::new()),
            relay: None,
        };
        Thoughtspace::open(config, stores, Arc::new(MemoryView::new()))
    }

    fn handler(thoughtspace: &Thoughtspace) -> EngineHandler {
        EngineHandler {
            engine: Arc::downgrade(&thoughtspace.inner),
        }
    }

    #[tokio::test]
    async fn test_replayed_lexeme_delete_empties_loaded_lexeme() {
        let store = Arc::new(RecordingStore::default());
        let thoughtspace = open(&store);
        let lexeme = Lexeme::new("Work", vec![ThoughtId::new("t1")]);
        thoughtspace
            .update_thoughts(UpdateBatch::new().put_lexeme(lexeme))
            .await
            .unwrap();
        let name = DocumentName::lexeme("ts", "work");
        store.ops.lock().clear();

        handler(&thoughtspace)
            .next(EntityKind::Lexeme, "work", DoclogAction::Delete)
            .await
            .unwrap();

        assert_eq!(store.ops_for(&name), vec!["append", "clear"]);
        assert!(!store.inner.contains(&name));
        assert!(!thoughtspace.lexemes().contains(&"work".to_string()));
    }

    #[tokio::test]
    async fn test_replayed_lexeme_delete_does_not_load() {
        let store = Arc::new(RecordingStore::default());
        let thoughtspace = open(&store);
        let lexeme = Lexeme::new("Work", vec![ThoughtId::new("t1")]);
        thoughtspace
            .update_thoughts(UpdateBatch::new().put_lexeme(lexeme))
            .await
            .unwrap();
        thoughtspace.free_lexeme("work");
        let name = DocumentName::lexeme("ts", "work");
        store.ops.lock().clear();

        handler(&thoughtspace)
            .next(EntityKind::Lexeme, "work", DoclogAction::Delete)
            .await
            .unwrap();

        assert_eq!(store.ops_for(&name), vec!["clear"]);
        assert!(!store.inner.contains(&name));
    }
}

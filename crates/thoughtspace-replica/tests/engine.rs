//! Engine tests against a shared in-memory local store.
//!
//! A second `Thoughtspace` opened on the same store plays the role of the
//! app restarting, or of another tab on the same device.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thoughtspace_replica::{
    DocumentName, EntityKind, Lexeme, LocalStore, MemoryStore, MemoryView, PersistenceError,
    ReplicaConfig, ReplicaConfigBuilder, StoreView, Stores, Thought, ThoughtId, Thoughtspace,
    UpdateBatch, ROOT, ROOT_PARENT_ID,
};

fn config(replica: &str) -> ReplicaConfig {
    ReplicaConfigBuilder::new()
        .tsid("ts")
        .replica_id(replica)
        .retry_delay(Duration::from_millis(20))
        .throttle_window(Duration::from_millis(10))
        .build()
}

fn open(store: &Arc<MemoryStore>, replica: &str) -> (Thoughtspace, Arc<MemoryView>) {
    let view = Arc::new(MemoryView::new());
    let thoughtspace =
        Thoughtspace::open(config(replica), Stores::memory(store.clone()), view.clone());
    if let Some(updates) = thoughtspace.take_updates() {
        view.follow(updates);
    }
    (thoughtspace, view)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn work_batch() -> (Thought, Lexeme, UpdateBatch) {
    let thought = Thought::new("t1", "Work", 0.0, ROOT);
    let lexeme = Lexeme::new("Work", vec![thought.id.clone()]);
    let batch = UpdateBatch::new()
        .put_thought(thought.clone())
        .put_lexeme(lexeme.clone());
    (thought, lexeme, batch)
}

#[tokio::test]
async fn test_thought_and_lexeme_survive_restart() {
    let store = Arc::new(MemoryStore::new());
    let (thought, lexeme, batch) = work_batch();

    let (first, _) = open(&store, "device");
    first.update_thoughts(batch).await.unwrap();

    let mut saved = tokio_test::task::spawn(first.wait_saved());
    tokio_test::assert_ready!(saved.poll());
    drop(saved);
    drop(first);

    assert!(store.contains(&DocumentName::thought("ts", &thought.id)));
    assert!(store.contains(&DocumentName::lexeme("ts", "work")));
    assert!(store.contains(&DocumentName::doclog("ts")));

    let (second, _) = open(&store, "device");
    assert_eq!(second.get_thought_by_id(&thought.id).await, Some(thought));
    assert_eq!(second.get_lexeme_by_id("work").await, Some(lexeme));
    assert_eq!(second.get_thought_by_id(&ThoughtId::new("missing")).await, None);
}

#[tokio::test]
async fn test_get_by_ids_preserves_order() {
    let store = Arc::new(MemoryStore::new());
    let (thoughtspace, _) = open(&store, "device");
    let a = Thought::new("a", "a", 0.0, ROOT);
    let b = Thought::new("b", "b", 1.0, ROOT);
    thoughtspace
        .update_thoughts(UpdateBatch::new().put_thought(a.clone()).put_thought(b.clone()))
        .await
        .unwrap();

    let found = thoughtspace
        .get_thoughts_by_ids(&[b.id.clone(), ThoughtId::new("none"), a.id.clone()])
        .await;
    assert_eq!(found, vec![Some(b), None, Some(a.clone())]);

    let entity = thoughtspace.get_by_id(EntityKind::Thought, "a").await;
    assert_eq!(entity.and_then(|e| e.into_thought()), Some(a));
}

#[tokio::test]
async fn test_delete_without_load() {
    let store = Arc::new(MemoryStore::new());
    let (thought, _, batch) = work_batch();
    let name = DocumentName::thought("ts", &thought.id);

    let (first, _) = open(&store, "device");
    first.update_thoughts(batch).await.unwrap();
    drop(first);
    assert!(store.contains(&name));

    let (second, _) = open(&store, "device");
    assert!(!second.thoughts().contains(&thought.id));
    second
        .update_thoughts(UpdateBatch::new().delete_thought(thought.id.clone()))
        .await
        .unwrap();

    assert!(!store.contains(&name));
    assert_eq!(second.get_thought_by_id(&thought.id).await, None);

    // deleting again is not an error
    second
        .update_thoughts(UpdateBatch::new().delete_thought(thought.id.clone()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_doclog_replay_reproduces_live_ids() {
    let store = Arc::new(MemoryStore::new());
    let (writer, _) = open(&store, "writer");
    let kept = Thought::new("kept", "Kept", 0.0, ROOT);
    let gone = Thought::new("gone", "Gone", 1.0, ROOT);
    writer
        .update_thoughts(UpdateBatch::new().put_thought(kept.clone()).put_thought(gone.clone()))
        .await
        .unwrap();
    writer
        .update_thoughts(UpdateBatch::new().delete_thought(gone.id.clone()))
        .await
        .unwrap();
    drop(writer);

    let (reader, view) = open(&store, "reader");
    view.apply(&UpdateBatch::initial());
    reader.when_synced().await;

    // nothing is replayed until replication is started
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reader.replication().cursors().await.unwrap().thoughts, 0);
    assert!(!reader.thoughts().contains(&kept.id));

    reader.start_replication();
    reader.replication().wait_idle().await;

    assert!(reader.thoughts().contains(&kept.id));
    assert!(!reader.thoughts().contains(&gone.id));
    eventually(|| view.thought(&kept.id).is_some()).await;
    assert!(view.thought(&gone.id).is_none());

    let cursors = reader.replication().cursors().await.unwrap();
    let logged = reader
        .replication()
        .doclog()
        .read(|log| log.len(EntityKind::Thought));
    assert_eq!(cursors.thoughts, logged);
    assert_eq!(logged, 3);
}

#[tokio::test]
async fn test_background_load_skips_unrelated_thoughts() {
    let store = Arc::new(MemoryStore::new());
    let (writer, _) = open(&store, "writer");
    let elsewhere = Thought::new("child", "Child", 0.0, "unloaded-parent");
    writer
        .update_thoughts(UpdateBatch::new().put_thought(elsewhere.clone()))
        .await
        .unwrap();
    drop(writer);

    let (reader, view) = open(&store, "reader");
    view.apply(&UpdateBatch::initial());
    reader.when_synced().await;
    reader.start_replication();
    reader.replication().wait_idle().await;

    assert!(!reader.thoughts().contains(&elsewhere.id));
    assert!(view.thought(&elsewhere.id).is_none());
}

#[tokio::test]
async fn test_lexeme_write_without_previous_merges_stored_contexts() {
    let store = Arc::new(MemoryStore::new());
    let (first, _) = open(&store, "first");
    first
        .update_thoughts(UpdateBatch::new().put_lexeme(Lexeme::new("Work", vec!["t1".into()])))
        .await
        .unwrap();
    drop(first);

    let (second, view) = open(&store, "second");
    second
        .update_thoughts(UpdateBatch::new().put_lexeme(Lexeme::new("Work", vec!["t2".into()])))
        .await
        .unwrap();

    let merged = second.lexemes().get(&"work".to_string()).unwrap();
    assert!(merged.has_context(&"t1".into()));
    assert!(merged.has_context(&"t2".into()));

    // the store only knew about t2 and is told about the merge
    eventually(|| view.lexeme("work").is_some_and(|l| l.contexts.len() == 2)).await;
}

#[tokio::test]
async fn test_delete_lexeme_empties_contexts_first() {
    let store = Arc::new(MemoryStore::new());
    let (thoughtspace, _) = open(&store, "device");
    let (_, _, batch) = work_batch();
    thoughtspace.update_thoughts(batch).await.unwrap();

    thoughtspace
        .update_thoughts(UpdateBatch::new().delete_lexeme("work"))
        .await
        .unwrap();

    assert!(!store.contains(&DocumentName::lexeme("ts", "work")));
    assert!(!thoughtspace.lexemes().contains(&"work".to_string()));
    assert_eq!(thoughtspace.get_lexeme_by_id("work").await, None);
}

#[tokio::test]
async fn test_aborted_writes_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let (thoughtspace, _) = open(&store, "device");
    let mut alerts = thoughtspace.take_alerts().unwrap();
    thoughtspace.when_synced().await;

    store.inject_fault(PersistenceError::Aborted("transaction aborted".into()));
    let (thought, _, batch) = work_batch();
    thoughtspace.update_thoughts(batch).await.unwrap();

    assert!(store.contains(&DocumentName::thought("ts", &thought.id)));
    assert!(store.contains(&DocumentName::doclog("ts")));
    assert_eq!(thoughtspace.get_thought_by_id(&thought.id).await, Some(thought));
    assert!(alerts.try_recv().is_err());
}

#[tokio::test]
async fn test_io_errors_raise_alerts() {
    let store = Arc::new(MemoryStore::new());
    let (thoughtspace, _) = open(&store, "device");
    let mut alerts = thoughtspace.take_alerts().unwrap();
    assert!(thoughtspace.take_alerts().is_none());
    thoughtspace.when_synced().await;

    store.inject_fault(PersistenceError::Io("disk full".into()));
    let (_, _, batch) = work_batch();
    thoughtspace.update_thoughts(batch).await.unwrap();

    let alert = tokio::time::timeout(Duration::from_secs(1), alerts.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(alert.starts_with("Error saving"), "{alert}");
    assert!(alert.contains("disk full"), "{alert}");
}

#[tokio::test]
async fn test_clear_leaves_initial_thoughts() {
    let store = Arc::new(MemoryStore::new());
    let (thoughtspace, _) = open(&store, "device");
    let (thought, _, batch) = work_batch();
    thoughtspace.update_thoughts(batch).await.unwrap();

    thoughtspace.clear().await.unwrap();

    assert!(!store.contains(&DocumentName::thought("ts", &thought.id)));
    assert!(!store.contains(&DocumentName::lexeme("ts", "work")));
    assert_eq!(thoughtspace.get_thought_by_id(&thought.id).await, None);
    let root = thoughtspace.get_thought_by_id(&ThoughtId::root()).await.unwrap();
    assert_eq!(root.parent_id, ThoughtId::new(ROOT_PARENT_ID));
}

#[tokio::test]
async fn test_replicate_tree_visits_descendants() {
    let store = Arc::new(MemoryStore::new());
    let (writer, _) = open(&store, "writer");
    let grandchild = Thought::new("b", "Grandchild", 0.0, "a");
    let child = Thought::new("a", "Child", 0.0, ROOT).with_child(&grandchild);
    let root = Thought::new(ROOT, ROOT, 0.0, ROOT_PARENT_ID).with_child(&child);
    writer
        .update_thoughts(
            UpdateBatch::new()
                .put_thought(root)
                .put_thought(child)
                .put_thought(grandchild),
        )
        .await
        .unwrap();
    drop(writer);

    let (reader, _) = open(&store, "reader");
    let visited = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let tree = {
        let visited = visited.clone();
        reader.replicate_tree(&ThoughtId::root(), false, move |thought| {
            visited.lock().push(thought.id.clone())
        })
    };
    let thoughts = tree.finish().await;

    let mut visited = visited.lock().clone();
    visited.sort();
    assert_eq!(
        visited,
        vec![ThoughtId::root(), ThoughtId::new("a"), ThoughtId::new("b")]
    );
    assert_eq!(
        thoughts.keys().cloned().collect::<Vec<_>>(),
        vec![ThoughtId::root(), ThoughtId::new("a"), ThoughtId::new("b")]
    );
    assert_eq!(thoughts[&ThoughtId::new("b")].value, "Grandchild");
    // the store shows none of them, so nothing stays registered
    assert!(reader.thoughts().is_empty());
}

#[tokio::test]
async fn test_cancelled_tree_finishes() {
    let store = Arc::new(MemoryStore::new());
    let (thoughtspace, _) = open(&store, "device");
    let tree = thoughtspace.replicate_tree(&ThoughtId::root(), false, |_| {});
    tree.cancel();
    assert!(tree.is_cancelled());
    tokio::time::timeout(Duration::from_secs(1), tree.finish())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_saving_pauses_replication() {
    let store = Arc::new(MemoryStore::new());
    let (thoughtspace, _) = open(&store, "device");
    thoughtspace.start_replication();
    assert!(!thoughtspace.replication().is_paused());

    thoughtspace.set_pulling(true);
    assert!(thoughtspace.replication().is_paused());
    assert!(thoughtspace.status().is_pulling());
    thoughtspace.set_pulling(false);
    assert!(!thoughtspace.replication().is_paused());

    let (_, _, batch) = work_batch();
    thoughtspace.update_thoughts(batch).await.unwrap();
    thoughtspace.wait_saved().await;
    eventually(|| !thoughtspace.replication().is_paused()).await;
    assert_eq!(thoughtspace.status().saving_progress(), 1.0);

    thoughtspace.pause_replication();
    assert!(thoughtspace.replication().is_paused());
}

/// Local store whose deletes take a while.
struct SlowClearStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl LocalStore for SlowClearStore {
    async fn load(&self, name: &DocumentName) -> Result<Vec<Vec<u8>>, PersistenceError> {
        self.inner.load(name).await
    }

    async fn append(&self, name: &DocumentName, update: Vec<u8>) -> Result<(), PersistenceError> {
        self.inner.append(name, update).await
    }

    async fn clear(&self, name: &DocumentName) -> Result<(), PersistenceError> {
        tokio::time::sleep(self.delay).await;
        self.inner.clear(name).await
    }
}

#[tokio::test]
async fn test_replication_stays_paused_while_deleting() {
    let store = Arc::new(MemoryStore::new());
    let stores = Stores {
        local: Arc::new(SlowClearStore {
            inner: store.clone(),
            delay: Duration::from_millis(300),
        }),
        meta: store.clone(),
        relay: None,
    };
    let thoughtspace = Thoughtspace::open(config("device"), stores, Arc::new(MemoryView::new()));
    let (thought, _, batch) = work_batch();
    thoughtspace.update_thoughts(batch).await.unwrap();
    thoughtspace.start_replication();
    eventually(|| !thoughtspace.replication().is_paused()).await;

    let writer = thoughtspace.clone();
    let write = tokio::spawn(async move {
        writer
            .update_thoughts(
                UpdateBatch::new()
                    .put_thought(Thought::new("t2", "Home", 1.0, ROOT))
                    .delete_thought(thought.id),
            )
            .await
    });

    // the put has been saved, the delete is still running
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(thoughtspace.replication().is_paused());
    assert!(thoughtspace.status().saving_progress() < 1.0);

    write.await.unwrap().unwrap();
    thoughtspace.wait_saved().await;
    eventually(|| !thoughtspace.replication().is_paused()).await;
    assert!(!store.contains(&DocumentName::thought("ts", &ThoughtId::new("t1"))));
}

//! Doclog replication controller.
//!
//! Walks both doclog columns from persisted cursors and hands each entry to
//! a [`DoclogHandler`]. The cursor of a column is persisted right after its
//! entry has been handled, so a restart resumes where the last run stopped.

use crate::doclog::{encode_update, Doclog, DoclogAction, DoclogEntry};
use crate::entity::EntityKind;
use crate::error::Result;
use crate::name::DocumentName;
use crate::persistence::MetaStore;
use crate::shared::{DocEvent, Origin, SharedDoc};
use crate::task_queue::{EndCallback, Progress, StepCallback};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thoughtspace_crdt::ReplicaId;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub const THOUGHT_CURSOR_KEY: &str = "thoughtReplicationCursor";
pub const LEXEME_CURSOR_KEY: &str = "lexemeReplicationCursor";

/// Reacts to one doclog entry.
#[async_trait]
pub trait DoclogHandler: Send + Sync + 'static {
    async fn next(&self, kind: EntityKind, id: &str, action: DoclogAction) -> Result<()>;
}

/// Number of handled entries per column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursors {
    pub thoughts: usize,
    pub lexemes: usize,
}

impl Cursors {
    pub fn get(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Thought => self.thoughts,
            EntityKind::Lexeme => self.lexemes,
        }
    }

    fn advance(&mut self, kind: EntityKind) -> usize {
        let cursor = match kind {
            EntityKind::Thought => &mut self.thoughts,
            EntityKind::Lexeme => &mut self.lexemes,
        };
        *cursor += 1;
        *cursor
    }
}

#[derive(Default)]
pub struct ReplicationOptions {
    autostart: bool,
    on_step: Option<StepCallback>,
    on_end: Option<EndCallback>,
}

impl ReplicationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start draining immediately instead of waiting for `start`.
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn on_step(mut self, f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.on_step = Some(Arc::new(f));
        self
    }

    pub fn on_end(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(f));
        self
    }
}

struct ControllerState {
    paused: bool,
    running: bool,
    cursors: Option<Cursors>,
}

struct ControllerInner {
    doclog: SharedDoc<Doclog>,
    meta: Arc<dyn MetaStore>,
    handler: Arc<dyn DoclogHandler>,
    tsid: String,
    state: Mutex<ControllerState>,
    wake: Notify,
    changed: watch::Sender<u64>,
    on_step: Option<StepCallback>,
    on_end: Option<EndCallback>,
}

pub struct ReplicationController {
    inner: Arc<ControllerInner>,
    worker: JoinHandle<()>,
}

impl ReplicationController {
    pub fn spawn(
        doclog: SharedDoc<Doclog>,
        meta: Arc<dyn MetaStore>,
        handler: Arc<dyn DoclogHandler>,
        options: ReplicationOptions,
    ) -> Self {
        let inner = Arc::new(ControllerInner {
            tsid: doclog.name().tsid().to_string(),
            doclog,
            meta,
            handler,
            state: Mutex::new(ControllerState {
                paused: !options.autostart,
                running: false,
                cursors: None,
            }),
            wake: Notify::new(),
            changed: watch::channel(0).0,
            on_step: options.on_step,
            on_end: options.on_end,
        });
        let events = inner.doclog.subscribe();
        let worker = tokio::spawn(run(inner.clone(), events));
        if options.autostart {
            inner.wake.notify_one();
        }
        Self { inner, worker }
    }

    pub fn doclog(&self) -> &SharedDoc<Doclog> {
        &self.inner.doclog
    }

    /// Resume draining.
    pub fn start(&self) {
        let resumed = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.paused, false)
        };
        if resumed {
            debug!(tsid = %self.inner.tsid, "Replication started");
        }
        self.inner.wake.notify_one();
        self.inner.bump();
    }

    /// Stop after the entry currently being handled.
    pub fn pause(&self) {
        let paused = {
            let mut state = self.inner.state.lock();
            !std::mem::replace(&mut state.paused, true)
        };
        if paused {
            debug!(tsid = %self.inner.tsid, "Replication paused");
        }
        self.inner.bump();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    /// Append entries to the doclog on behalf of `writer`. Returns the
    /// encoded update so the caller can persist it.
    pub fn log(
        &self,
        writer: &ReplicaId,
        thoughts: &[DoclogEntry],
        lexemes: &[DoclogEntry],
    ) -> Result<Option<Arc<Vec<u8>>>> {
        if thoughts.is_empty() && lexemes.is_empty() {
            return Ok(None);
        }
        let (_, update) = self
            .inner
            .doclog
            .mutate(Origin::Writer(writer.clone()), |log| {
                let update = log.log(thoughts, lexemes);
                if update.is_empty() {
                    Ok(((), None))
                } else {
                    Ok(((), Some(encode_update(&update)?)))
                }
            })?;
        Ok(update)
    }

    /// Persisted cursors.
    pub async fn cursors(&self) -> Result<Cursors> {
        self.inner.load_cursors().await
    }

    /// Resolves once the controller is running, not mid-pass, and its
    /// cursors have reached the end of both columns.
    pub async fn wait_idle(&self) {
        let mut changed = self.inner.changed.subscribe();
        loop {
            if self.inner.is_caught_up() {
                return;
            }
            if changed.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for ReplicationController {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl ControllerInner {
    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn bump(&self) {
        self.changed.send_modify(|version| *version += 1);
    }

    fn is_caught_up(&self) -> bool {
        let (thoughts, lexemes) = self
            .doclog
            .read(|log| (log.len(EntityKind::Thought), log.len(EntityKind::Lexeme)));
        let state = self.state.lock();
        !state.paused
            && !state.running
            && state
                .cursors
                .is_some_and(|c| c.thoughts >= thoughts && c.lexemes >= lexemes)
    }

    fn cursor_key(&self, kind: EntityKind) -> String {
        let key = match kind {
            EntityKind::Thought => THOUGHT_CURSOR_KEY,
            EntityKind::Lexeme => LEXEME_CURSOR_KEY,
        };
        DocumentName::doclog_meta(&self.tsid, key)
    }

    async fn load_cursors(&self) -> Result<Cursors> {
        if let Some(cursors) = self.state.lock().cursors {
            return Ok(cursors);
        }
        let cursors = Cursors {
            thoughts: self.read_cursor(EntityKind::Thought).await?,
            lexemes: self.read_cursor(EntityKind::Lexeme).await?,
        };
        self.state.lock().cursors.get_or_insert(cursors);
        Ok(cursors)
    }

    async fn read_cursor(&self, kind: EntityKind) -> Result<usize> {
        let key = self.cursor_key(kind);
        let Some(value) = self.meta.get_item(&key).await? else {
            return Ok(0);
        };
        match value.parse() {
            Ok(cursor) => Ok(cursor),
            Err(_) => {
                warn!(key = %key, value = %value, "Invalid replication cursor, starting over");
                Ok(0)
            }
        }
    }

    fn set_running(&self, running: bool) {
        self.state.lock().running = running;
        self.bump();
    }

    async fn drain(&self) -> Result<()> {
        let mut cursors = self.load_cursors().await?;
        let (thoughts, lexemes) = self.doclog.read(|log| {
            (
                log.entries_from(EntityKind::Thought, cursors.thoughts),
                log.entries_from(EntityKind::Lexeme, cursors.lexemes),
            )
        });
        let total = thoughts.len() + lexemes.len();
        if total == 0 {
            self.bump();
            return Ok(());
        }

        debug!(tsid = %self.tsid, total, "Replicating doclog entries");
        self.set_running(true);
        let result = self
            .replay(
                &mut cursors,
                [(EntityKind::Thought, thoughts), (EntityKind::Lexeme, lexemes)],
                total,
            )
            .await;
        self.set_running(false);
        result
    }

    async fn replay(
        &self,
        cursors: &mut Cursors,
        columns: [(EntityKind, Vec<DoclogEntry>); 2],
        total: usize,
    ) -> Result<()> {
        let mut completed = 0;
        for (kind, entries) in columns {
            for entry in entries {
                if self.is_paused() {
                    debug!(tsid = %self.tsid, completed, total, "Replication paused mid-pass");
                    return Ok(());
                }

                let action = entry.action(kind)?;
                self.handler.next(kind, &entry.id, action).await?;

                let cursor = cursors.advance(kind);
                self.meta
                    .set_item(&self.cursor_key(kind), cursor.to_string())
                    .await?;
                self.state.lock().cursors = Some(*cursors);

                completed += 1;
                if let Some(on_step) = &self.on_step {
                    on_step(Progress { completed, total });
                }
                self.bump();
            }
        }

        if let Some(on_end) = &self.on_end {
            on_end();
        }
        Ok(())
    }
}

async fn run(inner: Arc<ControllerInner>, mut events: broadcast::Receiver<DocEvent>) {
    loop {
        if !inner.is_paused() {
            if let Err(e) = inner.drain().await {
                error!(tsid = %inner.tsid, error = %e, "Doclog replication pass failed");
            }
        }

        let keep_running = tokio::select! {
            _ = inner.wake.notified() => true,
            event = events.recv() => !matches!(event, Err(RecvError::Closed)),
            _ = inner.doclog.destroyed() => false,
        };
        if !keep_running {
            break;
        }
    }
}

//! Structural repair after remote data arrives.
//!
//! Only Thoughts listed as contexts of the Lexeme shown in the active
//! context view are checked. Two inconsistencies are fixed:
//!
//! - the Thought exists nowhere; the stale context is removed.
//! - the Thought's parent does not list it as a child; the context is
//!   removed, then the parent link, the Thought and its Lexeme context are
//!   written again.

use crate::batch::UpdateBatch;
use crate::entity::{Lexeme, Thought, ThoughtId};
use crate::error::Result;
use crate::registry::LoadMode;
use crate::thoughtspace::Inner;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A Thought to check, with its value once the relay had synced.
#[derive(Clone, Debug)]
pub(crate) struct RepairRequest {
    pub id: ThoughtId,
    pub thought: Option<Thought>,
}

pub(crate) fn spawn(
    engine: Weak<Inner>,
    mut requests: mpsc::UnboundedReceiver<RepairRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            let id = request.id.clone();
            if let Err(e) = repair(&engine, request).await {
                error!(id = %id, error = %e, "Repair failed");
            }
        }
    })
}

async fn repair(engine: &Arc<Inner>, request: RepairRequest) -> Result<()> {
    // only Thoughts listed by the Lexeme in the active context view are checked
    let Some(lexeme) = engine.ctx.view.context_view_lexeme() else {
        return Ok(());
    };
    if !lexeme.has_context(&request.id) {
        return Ok(());
    }
    match request.thought {
        None => remove_stale_context(engine, &request.id, lexeme).await,
        Some(thought) => restore_parent_link(engine, thought, lexeme).await,
    }
}

async fn remove_stale_context(engine: &Arc<Inner>, id: &ThoughtId, lexeme: Lexeme) -> Result<()> {
    warn!(id = %id, lexeme = %lexeme.key, "Removing context of missing thought");
    let batch = UpdateBatch::new().replace_lexeme(lexeme.clone().without_context(id), Some(lexeme));
    engine.update_thoughts(batch.clone()).await?;
    engine.ctx.throttle.push(batch);
    Ok(())
}

async fn restore_parent_link(engine: &Arc<Inner>, thought: Thought, viewed: Lexeme) -> Result<()> {
    if thought.id.is_well_known() {
        return Ok(());
    }
    let parent = engine
        .thoughts
        .load(thought.parent_id.clone(), LoadMode::Background)
        .await;
    let Some(parent) = parent else {
        error!(id = %thought.id, parent = %thought.parent_id, "Parent of thought is missing");
        return Ok(());
    };
    if parent.children_map.contains_key(&thought.child_key()) {
        return Ok(());
    }

    warn!(id = %thought.id, parent = %parent.id, "Restoring missing parent link");

    // drop the context first so the restored one is the newest write
    let stripped = viewed.clone().without_context(&thought.id);
    let batch = UpdateBatch::new().replace_lexeme(stripped.clone(), Some(viewed));
    engine.update_thoughts(batch.clone()).await?;
    engine.ctx.throttle.push(batch);

    let key = thought.lexeme_key();
    let current = if stripped.key == key {
        Some(stripped)
    } else {
        engine.lexemes.load(key, LoadMode::Background).await
    };
    let restored = match &current {
        Some(lexeme) => lexeme.clone().with_context(thought.id.clone()),
        None => Lexeme::new(thought.value.clone(), vec![thought.id.clone()]),
    };
    let batch = UpdateBatch::new()
        .put_thought(parent.with_child(&thought))
        .put_thought(thought)
        .replace_lexeme(restored, current);
    engine.update_thoughts(batch.clone()).await?;
    engine.ctx.throttle.push(batch);
    debug!("Parent link restored");
    Ok(())
}

//! Merges change notifications that arrive close together.

use crate::batch::UpdateBatch;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct ThrottleState {
    pending: Option<UpdateBatch>,
    open: bool,
}

struct ThrottleInner {
    window: Duration,
    state: Mutex<ThrottleState>,
    output: mpsc::UnboundedSender<UpdateBatch>,
}

/// The first batch after a quiet period is emitted at once and opens a
/// window; batches arriving inside the window are merged and emitted when
/// it closes.
#[derive(Clone)]
pub struct BatchThrottle {
    inner: Arc<ThrottleInner>,
}

impl BatchThrottle {
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<UpdateBatch>) {
        let (output, rx) = mpsc::unbounded_channel();
        let throttle = Self {
            inner: Arc::new(ThrottleInner {
                window,
                state: Mutex::new(ThrottleState::default()),
                output,
            }),
        };
        (throttle, rx)
    }

    pub fn push(&self, batch: UpdateBatch) {
        if batch.is_empty() {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.open {
                state.pending.get_or_insert_with(UpdateBatch::new).merge(batch);
                return;
            }
            state.open = true;
        }
        let _ = self.inner.output.send(batch);
        self.schedule();
    }

    fn schedule(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(inner.window).await;
                let batch = {
                    let mut state = inner.state.lock();
                    match state.pending.take() {
                        Some(batch) => batch,
                        None => {
                            state.open = false;
                            return;
                        }
                    }
                };
                let _ = inner.output.send(batch);
            }
        });
    }
}

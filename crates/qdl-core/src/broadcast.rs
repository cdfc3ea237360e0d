//! Process-wide progress slot.
//!
//! Sessions report through an explicit [`QdlObserver`]; this module only
//! exists so the C boundary can keep its single global callback. Register
//! before a run starts and leave the slot alone until it finishes.

use std::sync::{Arc, RwLock};

use crate::events::{ProgressEvent, QdlEvent, QdlObserver};

/// Callback stored in the slot.
pub type ProgressSink = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

static SLOT: RwLock<Option<ProgressSink>> = RwLock::new(None);

/// Replace the registered sink; `None` clears it.
pub fn set_progress_sink(sink: Option<ProgressSink>) {
    let mut slot = SLOT.write().unwrap_or_else(|e| e.into_inner());
    *slot = sink;
}

/// Whether a sink is currently registered.
pub fn has_progress_sink() -> bool {
    SLOT.read().unwrap_or_else(|e| e.into_inner()).is_some()
}

/// Forward `event` to the registered sink, if any. Runs on the caller's thread.
pub fn broadcast(event: &ProgressEvent) {
    // Clone out of the lock so a sink may re-register without deadlocking.
    let sink = SLOT.read().unwrap_or_else(|e| e.into_inner()).clone();
    if let Some(sink) = sink {
        sink(event);
    }
}

/// Observer that forwards progress events into the process-wide slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct BroadcastObserver;

impl QdlObserver for BroadcastObserver {
    fn on_event(&self, event: &QdlEvent) {
        if let QdlEvent::Progress(p) = event {
            broadcast(p);
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Which conversations currently have a live generation writing into them.
///
/// Written by the streaming transport's lifecycle hooks and read by the sync
/// reconciler. Starts are counted per conversation, so overlapping streams
/// into the same conversation keep it flagged until the last one finishes.
#[derive(Debug, Clone, Default)]
pub struct StreamingGuard {
    active: Arc<Mutex<HashMap<String, usize>>>,
}

impl StreamingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, conversation_id: &str) {
        let mut active = self.active.lock();
        *active.entry(conversation_id.to_string()).or_insert(0) += 1;
        tracing::debug!("Streaming started in {}", conversation_id);
    }

    pub fn finish(&self, conversation_id: &str) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(conversation_id) {
            *count -= 1;
            if *count == 0 {
                active.remove(conversation_id);
                tracing::debug!("Streaming finished in {}", conversation_id);
            }
        }
    }

    /// Flag `conversation_id` until the returned lease is dropped.
    pub fn lease(&self, conversation_id: &str) -> StreamingLease {
        self.start(conversation_id);
        StreamingLease {
            guard: self.clone(),
            conversation_id: conversation_id.to_string(),
        }
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.active.lock().contains_key(conversation_id)
    }

    pub fn any_streaming(&self) -> bool {
        !self.active.lock().is_empty()
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Clears its conversation's streaming flag on drop.
#[derive(Debug)]
pub struct StreamingLease {
    guard: StreamingGuard,
    conversation_id: String,
}

impl StreamingLease {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for StreamingLease {
    fn drop(&mut self) {
        self.guard.finish(&self.conversation_id);
    }
}

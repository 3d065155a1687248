use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::models::{Conversation, Message};

/// Mutation committed to the local store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ConversationAdded(Conversation),
    ConversationUpdated(Conversation),
    ConversationDeleted {
        id: String,
    },
    ConversationsDeleted {
        ids: Vec<String>,
    },
    MessageAdded(Message),
    MessageUpdated(Message),
    MessageDeleted {
        id: String,
        conversation_id: String,
    },
    /// A bulk write; carries only the records that were inserted or changed.
    MessagesSynced {
        messages: Vec<Message>,
    },
    MessageIdReplaced {
        old_id: String,
        message: Message,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConversationAdded,
    ConversationUpdated,
    ConversationDeleted,
    ConversationsDeleted,
    MessageAdded,
    MessageUpdated,
    MessageDeleted,
    MessagesSynced,
    MessageIdReplaced,
}

impl StoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StoreEvent::ConversationAdded(_) => EventKind::ConversationAdded,
            StoreEvent::ConversationUpdated(_) => EventKind::ConversationUpdated,
            StoreEvent::ConversationDeleted { .. } => EventKind::ConversationDeleted,
            StoreEvent::ConversationsDeleted { .. } => EventKind::ConversationsDeleted,
            StoreEvent::MessageAdded(_) => EventKind::MessageAdded,
            StoreEvent::MessageUpdated(_) => EventKind::MessageUpdated,
            StoreEvent::MessageDeleted { .. } => EventKind::MessageDeleted,
            StoreEvent::MessagesSynced { .. } => EventKind::MessagesSynced,
            StoreEvent::MessageIdReplaced { .. } => EventKind::MessageIdReplaced,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Fan-out of store events with at most one subscriber per event kind.
///
/// Handlers run synchronously on the write worker right after the commit
/// they describe, so they observe events in commit order. They must not
/// block on the write queue.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    slots: Arc<RwLock<HashMap<EventKind, EventHandler>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`.
    ///
    /// # Panics
    ///
    /// Panics if `kind` already has a subscriber: one state layer owns each
    /// event, and a second registration is a wiring bug.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let mut slots = self.slots.write();
        assert!(
            !slots.contains_key(&kind),
            "{:?} already has a subscriber",
            kind
        );
        slots.insert(kind, Arc::new(handler));
    }

    /// Free the slot for `kind`. Returns whether a handler was registered.
    pub fn unsubscribe(&self, kind: EventKind) -> bool {
        self.slots.write().remove(&kind).is_some()
    }

    pub fn has_subscriber(&self, kind: EventKind) -> bool {
        self.slots.read().contains_key(&kind)
    }

    /// Deliver `event` to its subscriber, if any.
    pub fn emit(&self, event: StoreEvent) {
        // Clone the handler out so it runs without holding the lock and may
        // itself (un)subscribe.
        let handler = self.slots.read().get(&event.kind()).cloned();
        match handler {
            Some(handler) => handler(&event),
            None => tracing::trace!("No subscriber for {:?}", event.kind()),
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<EventKind> = self.slots.read().keys().copied().collect();
        f.debug_struct("ChangeNotifier")
            .field("subscribed", &kinds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_reaches_only_matching_subscriber() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        notifier.subscribe(EventKind::ConversationDeleted, move |event| {
            sink.lock().push(event.kind());
        });

        notifier.emit(StoreEvent::ConversationDeleted {
            id: "c1".to_string(),
        });
        notifier.emit(StoreEvent::ConversationsDeleted {
            ids: vec!["c2".to_string()],
        });

        assert_eq!(*seen.lock(), vec![EventKind::ConversationDeleted]);
    }

    #[test]
    #[should_panic(expected = "already has a subscriber")]
    fn test_second_subscriber_panics() {
        let notifier = ChangeNotifier::new();
        notifier.subscribe(EventKind::MessageAdded, |_| {});
        notifier.subscribe(EventKind::MessageAdded, |_| {});
    }

    #[test]
    fn test_unsubscribe_frees_slot() {
        let notifier = ChangeNotifier::new();
        notifier.subscribe(EventKind::MessageAdded, |_| {});
        assert!(notifier.has_subscriber(EventKind::MessageAdded));
        assert!(notifier.unsubscribe(EventKind::MessageAdded));
        assert!(!notifier.unsubscribe(EventKind::MessageAdded));
        notifier.subscribe(EventKind::MessageAdded, |_| {});
    }
}

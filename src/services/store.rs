use anyhow::Result;

use crate::models::{
    trim_to_millis, Conversation, ConversationUpdate, Message, MessageIdentity, MessageStatus,
    MessageUpdate,
};
use crate::services::database::{Database, PutOutcome};
use crate::services::events::{ChangeNotifier, StoreEvent};
use crate::services::write_queue::WriteQueue;

/// Local-first conversation store.
///
/// Reads hit the database directly. Every mutation goes through the write
/// queue and, once its transaction has committed, emits exactly one event on
/// the change notifier. Mutations that change nothing emit nothing.
#[derive(Debug, Clone)]
pub struct LocalStore {
    db: Database,
    queue: WriteQueue,
    notifier: ChangeNotifier,
}

impl LocalStore {
    /// Must be called from within a tokio runtime (spawns the write worker).
    pub fn new(db: Database) -> Self {
        Self {
            db,
            queue: WriteQueue::new(),
            notifier: ChangeNotifier::new(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    // --- Reads ---

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.db.get_conversation(id).await
    }

    /// All conversations, most recently updated first.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.db.list_conversations().await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.db.get_message(id).await
    }

    /// Messages of one conversation in ascending `created_at` order.
    pub async fn get_messages_for_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.db.list_messages(conversation_id).await
    }

    pub async fn count_messages(&self, conversation_id: &str) -> Result<usize> {
        self.db.count_messages(conversation_id).await
    }

    // --- Conversation writes ---

    pub async fn put_conversation(&self, conversation: Conversation) -> Result<PutOutcome> {
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let conversation = conversation.normalized();
        self.queue
            .enqueue(move || async move {
                let outcome = db.upsert_conversation(&conversation).await?;
                tracing::debug!("put_conversation {} -> {:?}", conversation.id, outcome);
                match outcome {
                    PutOutcome::Inserted => notifier.emit(StoreEvent::ConversationAdded(conversation)),
                    PutOutcome::Updated => notifier.emit(StoreEvent::ConversationUpdated(conversation)),
                    PutOutcome::Unchanged => {}
                }
                Ok(outcome)
            })
            .await
    }

    /// Merge fields into an existing conversation. Missing ids are a no-op.
    pub async fn update_conversation_fields(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> Result<Option<Conversation>> {
        if update.is_empty() {
            return self.db.get_conversation(id).await;
        }
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let id = id.to_string();
        self.queue
            .enqueue(move || async move {
                let updated = db.update_conversation(&id, update).await?;
                if let Some(conv) = &updated {
                    notifier.emit(StoreEvent::ConversationUpdated(conv.clone()));
                }
                Ok(updated)
            })
            .await
    }

    pub async fn delete_conversation_and_messages(&self, id: &str) -> Result<bool> {
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let id = id.to_string();
        self.queue
            .enqueue(move || async move {
                let removed = db.delete_conversations(std::slice::from_ref(&id)).await?;
                if removed.is_empty() {
                    return Ok(false);
                }
                tracing::debug!("Deleted conversation {} and its messages", id);
                notifier.emit(StoreEvent::ConversationDeleted { id });
                Ok(true)
            })
            .await
    }

    /// Bulk variant; one transaction, one event. Returns the ids removed.
    pub async fn delete_conversations_and_messages(&self, ids: Vec<String>) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        self.queue
            .enqueue(move || async move {
                let removed = db.delete_conversations(&ids).await?;
                if !removed.is_empty() {
                    tracing::debug!("Deleted {} conversations and their messages", removed.len());
                    notifier.emit(StoreEvent::ConversationsDeleted {
                        ids: removed.clone(),
                    });
                }
                Ok(removed)
            })
            .await
    }

    // --- Message writes ---

    pub async fn put_message(&self, message: Message) -> Result<PutOutcome> {
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let message = message.normalized();
        self.queue
            .enqueue(move || async move {
                let outcome = db.upsert_message(&message).await?;
                tracing::debug!("put_message {} -> {:?}", message.id(), outcome);
                match outcome {
                    PutOutcome::Inserted => notifier.emit(StoreEvent::MessageAdded(message)),
                    PutOutcome::Updated => notifier.emit(StoreEvent::MessageUpdated(message)),
                    PutOutcome::Unchanged => {}
                }
                Ok(outcome)
            })
            .await
    }

    /// Write a batch in one transaction. Returns how many records changed.
    pub async fn put_messages_bulk(&self, messages: Vec<Message>) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        self.queue
            .enqueue(move || async move {
                let written = db.upsert_messages(&messages).await?;
                let count = written.len();
                if count > 0 {
                    notifier.emit(StoreEvent::MessagesSynced {
                        messages: written.into_iter().map(|(_, msg)| msg).collect(),
                    });
                }
                Ok(count)
            })
            .await
    }

    /// Atomically swap the record at `temp_id` for `replacement`.
    ///
    /// No reader can observe both ids, or neither. Returns `false` without
    /// writing when `temp_id` is not stored.
    pub async fn replace_message(&self, temp_id: &str, replacement: Message) -> Result<bool> {
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let temp_id = temp_id.to_string();
        let replacement = replacement.normalized();
        self.queue
            .enqueue(move || async move {
                let replaced = db.replace_message(&temp_id, &replacement).await?;
                if replaced {
                    tracing::debug!("Replaced message {} with {}", temp_id, replacement.id());
                    notifier.emit(StoreEvent::MessageIdReplaced {
                        old_id: temp_id,
                        message: replacement,
                    });
                }
                Ok(replaced)
            })
            .await
    }

    /// Move a pending message to its backend-assigned identity.
    ///
    /// `created_at` and every field not set in `update` are carried over;
    /// status becomes `Sent` unless `update` says otherwise. Returns `None`
    /// if `temp_id` is unknown or already confirmed.
    pub async fn confirm_message(
        &self,
        temp_id: &str,
        confirmed_id: &str,
        update: MessageUpdate,
    ) -> Result<Option<Message>> {
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let temp_id = temp_id.to_string();
        let confirmed_id = confirmed_id.to_string();
        self.queue
            .enqueue(move || async move {
                let Some(pending) = db.get_message(&temp_id).await? else {
                    return Ok(None);
                };
                if !pending.is_optimistic() {
                    return Ok(None);
                }

                let mut confirmed = pending.clone();
                confirmed.identity = MessageIdentity::Confirmed(confirmed_id);
                confirmed.status = MessageStatus::Sent;
                update.apply_to(&mut confirmed);
                confirmed.updated_at = trim_to_millis(chrono::Utc::now()).max(pending.updated_at);
                let confirmed = confirmed.normalized();

                if !db.replace_message(&temp_id, &confirmed).await? {
                    return Ok(None);
                }
                notifier.emit(StoreEvent::MessageIdReplaced {
                    old_id: temp_id,
                    message: confirmed.clone(),
                });
                Ok(Some(confirmed))
            })
            .await
    }

    /// Merge fields into an existing message and bump its `updated_at`.
    /// Missing ids are a no-op and emit nothing.
    pub async fn update_message_fields(&self, id: &str, update: MessageUpdate) -> Result<Option<Message>> {
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let id = id.to_string();
        self.queue
            .enqueue(move || async move {
                let updated = db.update_message(&id, update).await?;
                if let Some(msg) = &updated {
                    notifier.emit(StoreEvent::MessageUpdated(msg.clone()));
                }
                Ok(updated)
            })
            .await
    }

    pub async fn delete_message(&self, id: &str) -> Result<bool> {
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let id = id.to_string();
        self.queue
            .enqueue(move || async move {
                let Some(msg) = db.delete_message(&id).await? else {
                    return Ok(false);
                };
                notifier.emit(StoreEvent::MessageDeleted {
                    id,
                    conversation_id: msg.conversation_id,
                });
                Ok(true)
            })
            .await
    }
}

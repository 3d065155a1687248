use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;

use crate::models::{trim_to_millis, Conversation, Message, MessageStatus, MessageUpdate, Role};
use crate::services::store::LocalStore;

/// What the UI gets back after an optimistic send.
#[derive(Debug, Clone)]
pub struct OptimisticSend {
    pub conversation: Conversation,
    pub message: Message,
    pub created_conversation: bool,
}

pub fn new_temp_id() -> String {
    format!("tmp-{}", Uuid::new_v4())
}

pub fn new_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Record a user message before the backend has seen it.
///
/// Without `conversation_id` a new conversation is created, titled after the
/// message. Otherwise the existing conversation's `updated_at` is bumped.
pub async fn send_optimistic(
    store: &LocalStore,
    conversation_id: Option<&str>,
    content: &str,
) -> Result<OptimisticSend> {
    let now = trim_to_millis(Utc::now());

    let (conversation, created_conversation) = match conversation_id {
        Some(id) => {
            let mut conv = store
                .get_conversation(id)
                .await?
                .with_context(|| format!("Conversation {} not found", id))?;
            conv.updated_at = now.max(conv.updated_at);
            (conv, false)
        }
        None => (
            Conversation::new(new_conversation_id(), truncate_title(content)),
            true,
        ),
    };
    store.put_conversation(conversation.clone()).await?;

    let message = Message::pending(new_temp_id(), &conversation.id, Role::User, content);
    store.put_message(message.clone()).await?;

    Ok(OptimisticSend {
        conversation,
        message,
        created_conversation,
    })
}

/// The backend accepted the message under `server_id`.
pub async fn confirm_sent(store: &LocalStore, temp_id: &str, server_id: &str) -> Result<Option<Message>> {
    store
        .confirm_message(temp_id, server_id, MessageUpdate::default())
        .await
}

/// The backend rejected or never received the message.
pub async fn mark_failed(store: &LocalStore, temp_id: &str) -> Result<Option<Message>> {
    store
        .update_message_fields(temp_id, MessageUpdate::status(MessageStatus::Failed))
        .await
}

/// Truncate text to a short title for conversations.
pub fn truncate_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    if first_line.len() > 50 {
        let boundary = first_line
            .char_indices()
            .take_while(|(i, _)| *i < 47)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(47);
        format!("{}...", &first_line[..boundary])
    } else {
        first_line.to_string()
    }
}

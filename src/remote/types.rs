use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    Conversation, Message, MessageExtras, MessageIdentity, MessageStatus, Role,
};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

// --- Conversation listing ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConversation {
    pub conversation_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub starred: bool,
    #[serde(rename = "isSystemGenerated", default)]
    pub is_system_generated: bool,
    #[serde(rename = "systemPurpose", default)]
    pub system_purpose: Option<String>,
    #[serde(rename = "isUnread", default)]
    pub is_unread: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl RemoteConversation {
    /// Local record for this conversation. The listing may carry only a
    /// description; it doubles as the title then.
    pub fn to_conversation(&self) -> Conversation {
        let title = self
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.description.clone())
            .unwrap_or_else(|| "New Chat".to_string());

        Conversation {
            id: self.conversation_id.clone(),
            title,
            description: self.description.clone(),
            is_starred: self.starred,
            is_system_generated: self.is_system_generated,
            system_purpose: self.system_purpose.clone(),
            is_unread: self.is_unread,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
        .normalized()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPage {
    pub conversations: Vec<RemoteConversation>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub total_pages: u32,
}

// --- Batch detail ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub conversations: Vec<BatchItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub conversations: Vec<RemoteConversationDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConversationDetail {
    pub conversation: RemoteConversation,
    #[serde(default)]
    pub messages: Vec<RemoteMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub message_id: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Temporary id the client used when it sent this message, if echoed back.
    #[serde(rename = "clientMessageId", default)]
    pub client_message_id: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
    #[serde(rename = "toolInvocations", default)]
    pub tool_invocations: Vec<serde_json::Value>,
    #[serde(rename = "followUpSuggestions", default)]
    pub follow_up_suggestions: Vec<String>,
    #[serde(rename = "replyTo", default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl RemoteMessage {
    pub fn to_message(&self, conversation_id: &str) -> Result<Message, RemoteError> {
        let role = Role::from_str(&self.role).ok_or_else(|| {
            RemoteError::InvalidResponse(format!(
                "Unknown role {:?} on message {}",
                self.role, self.message_id
            ))
        })?;
        // Anything the server holds has been accepted; only an explicit
        // failure survives.
        let status = match self.status.as_deref().and_then(MessageStatus::from_str) {
            Some(MessageStatus::Failed) => MessageStatus::Failed,
            _ => MessageStatus::Sent,
        };

        Ok(Message {
            identity: MessageIdentity::Confirmed(self.message_id.clone()),
            conversation_id: conversation_id.to_string(),
            role,
            content: self.content.clone(),
            status,
            created_at: self.created_at,
            updated_at: self.updated_at.unwrap_or(self.created_at),
            extras: MessageExtras {
                attachments: self.attachments.clone(),
                tool_invocations: self.tool_invocations.clone(),
                follow_ups: self.follow_up_suggestions.clone(),
                reply_to: self.reply_to.clone(),
                model: self.model.clone(),
            },
        }
        .normalized())
    }
}

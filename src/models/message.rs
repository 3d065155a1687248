use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// Identity of a message: a temporary client id until the backend confirms it.
///
/// A message moves from `Pending` to `Confirmed` exactly once, through
/// `LocalStore::confirm_message` / `LocalStore::replace_message`. The two ids
/// are never both live for the same logical message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageIdentity {
    Pending(String),
    Confirmed(String),
}

impl MessageIdentity {
    pub fn as_str(&self) -> &str {
        match self {
            MessageIdentity::Pending(id) | MessageIdentity::Confirmed(id) => id,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageIdentity::Pending(_))
    }
}

/// Auxiliary payload carried through sync verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageExtras {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_ups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl MessageExtras {
    pub fn is_empty(&self) -> bool {
        self == &MessageExtras::default()
    }

    /// Fill every field `self` leaves empty from `fallback`.
    pub fn or_from(mut self, fallback: &MessageExtras) -> Self {
        if self.attachments.is_empty() {
            self.attachments = fallback.attachments.clone();
        }
        if self.tool_invocations.is_empty() {
            self.tool_invocations = fallback.tool_invocations.clone();
        }
        if self.follow_ups.is_empty() {
            self.follow_ups = fallback.follow_ups.clone();
        }
        if self.reply_to.is_none() {
            self.reply_to = fallback.reply_to.clone();
        }
        if self.model.is_none() {
            self.model = fallback.model.clone();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub identity: MessageIdentity,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub extras: MessageExtras,
}

impl Message {
    /// A locally created message awaiting backend confirmation.
    pub fn pending(
        temp_id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        let now = super::trim_to_millis(Utc::now());
        Self {
            identity: MessageIdentity::Pending(temp_id.into()),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            status: MessageStatus::Sending,
            created_at: now,
            updated_at: now,
            extras: MessageExtras::default(),
        }
    }

    /// A backend-confirmed message.
    pub fn confirmed(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        let now = super::trim_to_millis(Utc::now());
        Self {
            identity: MessageIdentity::Confirmed(id.into()),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            status: MessageStatus::Sent,
            created_at: now,
            updated_at: now,
            extras: MessageExtras::default(),
        }
    }

    pub fn id(&self) -> &str {
        self.identity.as_str()
    }

    pub fn is_optimistic(&self) -> bool {
        self.identity.is_pending()
    }

    /// Timestamps at storage precision, `updated_at` clamped to `created_at`.
    pub fn normalized(mut self) -> Self {
        self.created_at = super::trim_to_millis(self.created_at);
        self.updated_at = super::trim_to_millis(self.updated_at);
        if self.updated_at < self.created_at {
            self.updated_at = self.created_at;
        }
        self
    }

    /// Timestamp used for last-writer-wins comparisons.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at.max(self.created_at)
    }
}

/// Partial update merged into a stored message by `update_message_fields`.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
    pub extras: Option<MessageExtras>,
}

impl MessageUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply_to(&self, message: &mut Message) {
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(status) = self.status {
            message.status = status;
        }
        if let Some(extras) = &self.extras {
            message.extras = extras.clone();
        }
    }
}

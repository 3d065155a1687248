use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub is_starred: bool,
    pub is_system_generated: bool,
    pub system_purpose: Option<String>,
    pub is_unread: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh, locally created conversation stamped with the current time.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = super::trim_to_millis(Utc::now());
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            is_starred: false,
            is_system_generated: false,
            system_purpose: None,
            is_unread: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Clamp `updated_at` so it never precedes `created_at`, at storage precision.
    pub fn normalized(mut self) -> Self {
        self.created_at = super::trim_to_millis(self.created_at);
        self.updated_at = super::trim_to_millis(self.updated_at);
        if self.updated_at < self.created_at {
            self.updated_at = self.created_at;
        }
        self
    }
}

/// Partial update for a stored conversation. `None` leaves the field as is.
#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub is_starred: Option<bool>,
    pub is_unread: Option<bool>,
}

impl ConversationUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.is_starred.is_none()
            && self.is_unread.is_none()
    }

    pub fn apply_to(&self, conversation: &mut Conversation) {
        if let Some(title) = &self.title {
            conversation.title = title.clone();
        }
        if let Some(description) = &self.description {
            conversation.description = description.clone();
        }
        if let Some(starred) = self.is_starred {
            conversation.is_starred = starred;
        }
        if let Some(unread) = self.is_unread {
            conversation.is_unread = unread;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_normalized_clamps_updated_at() {
        let mut conv = Conversation::new("c1", "Title");
        conv.updated_at = conv.created_at - Duration::minutes(5);
        let conv = conv.normalized();
        assert_eq!(conv.updated_at, conv.created_at);
    }

    #[test]
    fn test_update_applies_only_set_fields() {
        let mut conv = Conversation::new("c1", "Title");
        let update = ConversationUpdate {
            is_starred: Some(true),
            description: Some(Some("notes".to_string())),
            ..Default::default()
        };
        update.apply_to(&mut conv);
        assert_eq!(conv.title, "Title");
        assert!(conv.is_starred);
        assert_eq!(conv.description.as_deref(), Some("notes"));
        assert!(!conv.is_unread);
    }
}

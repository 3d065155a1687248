pub mod conversation;
pub mod message;

pub use conversation::{Conversation, ConversationUpdate};
pub use message::{Message, MessageExtras, MessageIdentity, MessageStatus, MessageUpdate, Role};

use chrono::{DateTime, Utc};

/// Drop sub-millisecond precision so timestamps survive a storage round trip
/// unchanged.
pub fn trim_to_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(dt)
}

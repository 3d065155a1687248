use async_trait::async_trait;

use super::types::{BatchItem, ConversationPage, RemoteConversationDetail, RemoteError};

/// The backend's conversation API, as seen by the sync reconciler.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// One page of conversations, most recently updated first. Pages start at 1.
    async fn list_conversations(&self, page: u32, limit: u32)
        -> Result<ConversationPage, RemoteError>;

    /// Full detail for every requested conversation updated after its
    /// `last_updated` (or unconditionally when that is absent).
    async fn fetch_conversations(
        &self,
        items: Vec<BatchItem>,
    ) -> Result<Vec<RemoteConversationDetail>, RemoteError>;
}

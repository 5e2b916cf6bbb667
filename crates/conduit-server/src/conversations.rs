//! In-memory conversation history, keyed by conversation id.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_llm::Message;
use tokio::sync::RwLock;

/// Shared store of finished conversations.
///
/// Entries are written from the engine's archive channel once a query
/// completes, and read back as history when the same id is reused.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    inner: Arc<RwLock<HashMap<String, Vec<Message>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// History for `id`, cloned so no lock is held across a query.
    pub async fn history(&self, id: &str) -> Option<Vec<Message>> {
        self.inner.read().await.get(id).cloned()
    }

    /// Replace the history of `id` with a finished conversation.
    pub async fn store(&self, id: impl Into<String>, messages: Vec<Message>) {
        let id = id.into();
        tracing::debug!(conversation_id = %id, messages = messages.len(), "Conversation archived");
        self.inner.write().await.insert(id, messages);
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.inner.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_replaces_history() {
        let store = ConversationStore::new();
        assert!(store.history("a").await.is_none());

        store.store("a", vec![Message::user("hi")]).await;
        store
            .store("a", vec![Message::user("hi"), Message::assistant("hello")])
            .await;

        assert_eq!(store.len().await, 1);
        assert_eq!(store.history("a").await.unwrap().len(), 2);
        assert!(store.remove("a").await);
        assert!(store.is_empty().await);
    }
}

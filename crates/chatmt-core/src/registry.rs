//! The Active-Generation Registry: tracks one cancellation signal per chat
//! currently generating, so an abort request can cooperatively interrupt
//! the matching in-flight generation task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};
use crate::model::ChatId;

#[derive(Clone, Default)]
pub struct GenerationRegistry {
    inner: Arc<Mutex<HashMap<ChatId, CancellationToken>>>,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `chat_id` as generating and returns its cancellation
    /// token. Fails with `Conflict` if that chat already has a
    /// generation in flight — only one generation per chat at a time.
    pub async fn start(&self, chat_id: ChatId) -> CoreResult<CancellationToken> {
        let mut map = self.inner.lock().await;
        if map.contains_key(&chat_id) {
            return Err(CoreError::conflict(format!("chat {chat_id} already has a generation in progress")));
        }
        let token = CancellationToken::new();
        map.insert(chat_id, token.clone());
        Ok(token)
    }

    /// Requests cancellation of `chat_id`'s generation, if any. A no-op,
    /// not an error, when the chat isn't generating — abort is inherently
    /// racy against natural completion.
    pub async fn signal_abort(&self, chat_id: &ChatId) {
        let map = self.inner.lock().await;
        if let Some(token) = map.get(chat_id) {
            token.cancel();
        }
    }

    /// Marks `chat_id` as no longer generating. Idempotent.
    pub async fn finish(&self, chat_id: &ChatId) {
        let mut map = self.inner.lock().await;
        map.remove(chat_id);
    }

    pub async fn is_active(&self, chat_id: &ChatId) -> bool {
        self.inner.lock().await.contains_key(chat_id)
    }

    /// Cancels every in-flight generation. Called at shutdown so a
    /// dropped connection doesn't leave orphaned provider requests
    /// running against a server that's going away.
    pub async fn cancel_all(&self) {
        let map = self.inner.lock().await;
        for token in map.values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_start_for_same_chat_conflicts() {
        let registry = GenerationRegistry::new();
        let chat_id = ChatId::new();
        registry.start(chat_id.clone()).await.unwrap();
        let err = registry.start(chat_id.clone()).await.unwrap_err();
        assert_eq!(err.kind, CoreError::conflict("x").kind);
    }

    #[tokio::test]
    async fn finish_allows_restarting_generation() {
        let registry = GenerationRegistry::new();
        let chat_id = ChatId::new();
        registry.start(chat_id.clone()).await.unwrap();
        registry.finish(&chat_id).await;
        assert!(registry.start(chat_id).await.is_ok());
    }

    #[tokio::test]
    async fn signal_abort_cancels_the_token() {
        let registry = GenerationRegistry::new();
        let chat_id = ChatId::new();
        let token = registry.start(chat_id.clone()).await.unwrap();
        assert!(!token.is_cancelled());
        registry.signal_abort(&chat_id).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn signal_abort_on_unknown_chat_is_a_no_op() {
        let registry = GenerationRegistry::new();
        registry.signal_abort(&ChatId::new()).await;
    }
}

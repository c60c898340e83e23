//! The branching Message Store.
//!
//! Backed by `sqlx`'s async SQLite driver, following the same
//! pool-plus-explicit-migrate shape as a plain key/value session store:
//! one `SqlitePool`, one `migrate()` run at startup, and each multi-step
//! operation wrapped in a transaction so a crash mid-write can never leave
//! a dangling branch pointer.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::CoreResult;
use crate::model::{Attachment, AttachmentKind, Chat, Character, ChatId, CharacterId, Message, MessageId, Role, ToolCallPayload};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub kind: AttachmentKind,
    pub content: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateMessageArgs {
    pub role: Option<Role>,
    pub body: String,
    pub attachments: Vec<NewAttachment>,
    pub parent_message_id: Option<MessageId>,
    pub model_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    pub thinking_content: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EditMessageArgs {
    pub body: String,
    pub model_name: Option<String>,
    pub attachments: Vec<NewAttachment>,
    pub tool_calls: Option<Vec<ToolCallPayload>>,
}

/// Persistent branching tree of messages, one tree per chat. All operations
/// are transactional: a failure partway through an operation leaves the
/// store exactly as it was before the call.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn create_chat(&self, character_id: Option<CharacterId>) -> CoreResult<Chat>;
    async fn get_chat(&self, chat_id: &ChatId) -> CoreResult<Option<Chat>>;
    async fn list_chats(&self) -> CoreResult<Vec<Chat>>;
    async fn delete_chat(&self, chat_id: &ChatId) -> CoreResult<()>;
    async fn touch_chat(&self, chat_id: &ChatId) -> CoreResult<()>;

    async fn create_character(&self, character: Character) -> CoreResult<Character>;
    async fn get_character(&self, id: &CharacterId) -> CoreResult<Option<Character>>;
    async fn list_characters(&self) -> CoreResult<Vec<Character>>;
    async fn delete_character(&self, id: &CharacterId) -> CoreResult<()>;

    /// `args.role` defaults to `user` when absent, since user-authored
    /// posts are the common case and rarely spell it out explicitly.
    async fn create_message(&self, chat_id: &ChatId, args: CreateMessageArgs) -> CoreResult<MessageId>;
    async fn get_message(&self, id: &MessageId) -> CoreResult<Option<Message>>;
    async fn list_messages(&self, chat_id: &ChatId) -> CoreResult<Vec<Message>>;
    async fn edit_message(&self, chat_id: &ChatId, id: &MessageId, args: EditMessageArgs) -> CoreResult<()>;
    async fn delete_message(&self, chat_id: &ChatId, id: &MessageId) -> CoreResult<()>;
    async fn set_active_branch(&self, parent_id: &MessageId, index: i64) -> CoreResult<()>;
}

pub(crate) fn clamp_active_index(index: i64, children_count: usize) -> i64 {
    if children_count == 0 {
        0
    } else {
        index.clamp(0, children_count as i64 - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_active_index_handles_empty_and_out_of_range() {
        assert_eq!(clamp_active_index(0, 0), 0);
        assert_eq!(clamp_active_index(5, 2), 1);
        assert_eq!(clamp_active_index(-1, 3), 0);
    }
}

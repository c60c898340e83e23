//! Core data model: chats, characters, messages and attachments.
//!
//! Mirrors the entities and invariants of the branching message tree: a
//! chat owns a tree of messages, each node pointing at its parent; the
//! `active_child_index` on a parent selects the currently active branch.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_newtype!(ChatId);
id_newtype!(MessageId);
id_newtype!(CharacterId);
id_newtype!(AttachmentId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" | "llm" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::File => "file",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_id: AttachmentId,
    pub message_id: MessageId,
    pub kind: AttachmentKind,
    pub content: String,
    pub name: Option<String>,
}

/// One requested tool invocation as carried on an assistant message, matching
/// the OpenAI-native `tool_calls` wire shape: `{id, type, function:{name, arguments}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON-encoded arguments object, not a parsed `Value` — this is the
    /// wire shape: arguments arrive (and are stored) as a string.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub role: Role,
    pub body: String,
    pub model_name: Option<String>,
    pub timestamp_ms: i64,
    pub parent_message_id: Option<MessageId>,
    pub active_child_index: i64,
    pub tool_call_id: Option<String>,
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    pub thinking_content: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Direct children, in timestamp order. Populated by `get_message`/`list_messages`.
    pub child_message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmbeddedModelBinding {
    pub model_name: Option<String>,
    pub model_provider: Option<String>,
    pub model_identifier: Option<String>,
    pub model_supports_images: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub character_id: CharacterId,
    pub character_name: String,
    pub sysprompt: String,
    pub model: EmbeddedModelBinding,
    pub cot_start_tag: Option<String>,
    pub cot_end_tag: Option<String>,
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: ChatId,
    pub timestamp_created: i64,
    pub timestamp_updated: i64,
    pub character_id: Option<CharacterId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatWithMessages {
    #[serde(flatten)]
    pub chat: Chat,
    pub messages: Vec<Message>,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_loose_parse() {
        assert_eq!(Role::from_str_loose("llm"), Some(Role::Assistant));
        assert_eq!(Role::from_str_loose("tool"), Some(Role::Tool));
        assert_eq!(Role::from_str_loose("bogus"), None);
    }

    #[test]
    fn id_newtype_displays_inner_string() {
        let id = MessageId::from("abc-123");
        assert_eq!(format!("{id}"), "abc-123");
    }
}

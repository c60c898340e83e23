use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::{clamp_active_index, CreateMessageArgs, EditMessageArgs, MessageStore, NewAttachment};
use crate::error::{CoreError, CoreResult};
use crate::model::{
    now_ms, Attachment, AttachmentId, AttachmentKind, Chat, Character, CharacterId, ChatId,
    EmbeddedModelBinding, Message, MessageId, Role, ToolCallPayload,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> CoreResult<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| CoreError::internal(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(%database_url, "message store ready");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS characters (
                character_id TEXT PRIMARY KEY,
                character_name TEXT UNIQUE NOT NULL,
                sysprompt TEXT NOT NULL DEFAULT '',
                model_name TEXT,
                model_provider TEXT,
                model_identifier TEXT,
                model_supports_images INTEGER,
                cot_start_tag TEXT,
                cot_end_tag TEXT,
                settings TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                chat_id TEXT PRIMARY KEY,
                timestamp_created INTEGER NOT NULL,
                timestamp_updated INTEGER NOT NULL,
                character_id TEXT,
                FOREIGN KEY (character_id) REFERENCES characters (character_id) ON DELETE SET NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                role TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                model_name TEXT,
                timestamp_ms INTEGER NOT NULL,
                parent_message_id TEXT,
                active_child_index INTEGER NOT NULL DEFAULT 0,
                tool_call_id TEXT,
                tool_calls TEXT,
                thinking_content TEXT,
                insertion_seq INTEGER,
                FOREIGN KEY (chat_id) REFERENCES chats (chat_id) ON DELETE CASCADE,
                FOREIGN KEY (parent_message_id) REFERENCES messages (message_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attachments (
                attachment_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                name TEXT,
                FOREIGN KEY (message_id) REFERENCES messages (message_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages (chat_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_parent_id ON messages (parent_message_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_attachments_message_id ON attachments (message_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chats_timestamp_updated ON chats (timestamp_updated DESC)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn fetch_attachments(
        &self,
        exec: &mut sqlx::SqliteConnection,
        message_id: &str,
    ) -> CoreResult<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT attachment_id, kind, content, name FROM attachments WHERE message_id = ? ORDER BY rowid",
        )
        .bind(message_id)
        .fetch_all(exec)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let kind_str: String = row.get("kind");
                Attachment {
                    attachment_id: AttachmentId(row.get("attachment_id")),
                    message_id: MessageId(message_id.to_string()),
                    kind: if kind_str == "image" {
                        AttachmentKind::Image
                    } else {
                        AttachmentKind::File
                    },
                    content: row.get("content"),
                    name: row.get("name"),
                }
            })
            .collect())
    }

    async fn fetch_children_ids(
        &self,
        exec: &mut sqlx::SqliteConnection,
        parent_id: &str,
    ) -> CoreResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT message_id FROM messages WHERE parent_message_id = ? ORDER BY timestamp_ms, insertion_seq",
        )
        .bind(parent_id)
        .fetch_all(exec)
        .await?;
        Ok(rows.into_iter().map(|row| row.get("message_id")).collect())
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Message> {
        let role_str: String = row.get("role");
        let role = Role::from_str_loose(&role_str)
            .ok_or_else(|| CoreError::internal(format!("corrupt role in storage: {role_str}")))?;
        let tool_calls_json: Option<String> = row.get("tool_calls");
        let tool_calls = match tool_calls_json {
            Some(s) if !s.is_empty() => Some(serde_json::from_str::<Vec<ToolCallPayload>>(&s)?),
            _ => None,
        };
        Ok(Message {
            message_id: MessageId(row.get("message_id")),
            chat_id: ChatId(row.get("chat_id")),
            role,
            body: row.get("body"),
            model_name: row.get("model_name"),
            timestamp_ms: row.get("timestamp_ms"),
            parent_message_id: row
                .get::<Option<String>, _>("parent_message_id")
                .map(MessageId),
            active_child_index: row.get("active_child_index"),
            tool_call_id: row.get("tool_call_id"),
            tool_calls,
            thinking_content: row.get("thinking_content"),
            attachments: Vec::new(),
            child_message_ids: Vec::new(),
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn create_chat(&self, character_id: Option<CharacterId>) -> CoreResult<Chat> {
        let chat = Chat {
            chat_id: ChatId::new(),
            timestamp_created: now_ms(),
            timestamp_updated: now_ms(),
            character_id,
        };
        sqlx::query(
            "INSERT INTO chats (chat_id, timestamp_created, timestamp_updated, character_id) VALUES (?, ?, ?, ?)",
        )
        .bind(chat.chat_id.as_str())
        .bind(chat.timestamp_created)
        .bind(chat.timestamp_updated)
        .bind(chat.character_id.as_ref().map(|c| c.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: &ChatId) -> CoreResult<Option<Chat>> {
        let row = sqlx::query(
            "SELECT chat_id, timestamp_created, timestamp_updated, character_id FROM chats WHERE chat_id = ?",
        )
        .bind(chat_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Chat {
            chat_id: ChatId(row.get("chat_id")),
            timestamp_created: row.get("timestamp_created"),
            timestamp_updated: row.get("timestamp_updated"),
            character_id: row.get::<Option<String>, _>("character_id").map(CharacterId),
        }))
    }

    async fn list_chats(&self) -> CoreResult<Vec<Chat>> {
        let rows = sqlx::query(
            "SELECT chat_id, timestamp_created, timestamp_updated, character_id FROM chats ORDER BY timestamp_updated DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Chat {
                chat_id: ChatId(row.get("chat_id")),
                timestamp_created: row.get("timestamp_created"),
                timestamp_updated: row.get("timestamp_updated"),
                character_id: row.get::<Option<String>, _>("character_id").map(CharacterId),
            })
            .collect())
    }

    async fn delete_chat(&self, chat_id: &ChatId) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM chats WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("chat {chat_id} not found")));
        }
        Ok(())
    }

    async fn touch_chat(&self, chat_id: &ChatId) -> CoreResult<()> {
        sqlx::query("UPDATE chats SET timestamp_updated = ? WHERE chat_id = ?")
            .bind(now_ms())
            .bind(chat_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_character(&self, mut character: Character) -> CoreResult<Character> {
        if character.character_id.as_str().is_empty() {
            character.character_id = CharacterId::new();
        }
        let settings = serde_json::to_string(&character.settings)?;
        let result = sqlx::query(
            r#"INSERT INTO characters
               (character_id, character_name, sysprompt, model_name, model_provider, model_identifier,
                model_supports_images, cot_start_tag, cot_end_tag, settings)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(character.character_id.as_str())
        .bind(&character.character_name)
        .bind(&character.sysprompt)
        .bind(&character.model.model_name)
        .bind(&character.model.model_provider)
        .bind(&character.model.model_identifier)
        .bind(character.model.model_supports_images.map(|b| b as i64))
        .bind(&character.cot_start_tag)
        .bind(&character.cot_end_tag)
        .bind(settings)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(character),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                CoreError::conflict(format!("character name '{}' already exists", character.character_name)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_character(&self, id: &CharacterId) -> CoreResult<Option<Character>> {
        let row = sqlx::query(
            r#"SELECT character_id, character_name, sysprompt, model_name, model_provider, model_identifier,
                      model_supports_images, cot_start_tag, cot_end_tag, settings
               FROM characters WHERE character_id = ?"#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let settings_str: String = row.get("settings");
        Ok(Some(Character {
            character_id: CharacterId(row.get("character_id")),
            character_name: row.get("character_name"),
            sysprompt: row.get("sysprompt"),
            model: EmbeddedModelBinding {
                model_name: row.get("model_name"),
                model_provider: row.get("model_provider"),
                model_identifier: row.get("model_identifier"),
                model_supports_images: row
                    .get::<Option<i64>, _>("model_supports_images")
                    .map(|v| v != 0),
            },
            cot_start_tag: row.get("cot_start_tag"),
            cot_end_tag: row.get("cot_end_tag"),
            settings: serde_json::from_str(&settings_str).unwrap_or(serde_json::json!({})),
        }))
    }

    async fn list_characters(&self) -> CoreResult<Vec<Character>> {
        let rows = sqlx::query("SELECT character_id FROM characters ORDER BY character_name")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("character_id");
            if let Some(c) = self.get_character(&CharacterId(id)).await? {
                out.push(c);
            }
        }
        Ok(out)
    }

    async fn delete_character(&self, id: &CharacterId) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM characters WHERE character_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("character {id} not found")));
        }
        Ok(())
    }

    async fn create_message(&self, chat_id: &ChatId, args: CreateMessageArgs) -> CoreResult<MessageId> {
        let message_id = MessageId::new();
        let role = args.role.unwrap_or(Role::User);
        let timestamp = now_ms();
        let tool_calls_json = match &args.tool_calls {
            Some(calls) => Some(serde_json::to_string(calls)?),
            None => None,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO messages
               (message_id, chat_id, role, body, model_name, timestamp_ms, parent_message_id,
                active_child_index, tool_call_id, tool_calls, thinking_content, insertion_seq)
               VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?,
                       (SELECT COALESCE(MAX(insertion_seq), 0) + 1 FROM messages))"#,
        )
        .bind(message_id.as_str())
        .bind(chat_id.as_str())
        .bind(role.as_str())
        .bind(&args.body)
        .bind(&args.model_name)
        .bind(timestamp)
        .bind(args.parent_message_id.as_ref().map(|p| p.as_str()))
        .bind(&args.tool_call_id)
        .bind(&tool_calls_json)
        .bind(&args.thinking_content)
        .execute(&mut *tx)
        .await?;

        for attachment in &args.attachments {
            sqlx::query(
                "INSERT INTO attachments (attachment_id, message_id, kind, content, name) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(AttachmentId::new().as_str())
            .bind(message_id.as_str())
            .bind(attachment.kind.as_str())
            .bind(&attachment.content)
            .bind(&attachment.name)
            .execute(&mut *tx)
            .await?;
        }

        if matches!(role, Role::Assistant | Role::Tool) {
            if let Some(parent_id) = &args.parent_message_id {
                let rows = sqlx::query(
                    "SELECT message_id FROM messages WHERE parent_message_id = ? ORDER BY timestamp_ms, insertion_seq",
                )
                .bind(parent_id.as_str())
                .fetch_all(&mut *tx)
                .await?;
                let children: Vec<String> = rows.into_iter().map(|r| r.get("message_id")).collect();
                if let Some(pos) = children.iter().position(|id| id == message_id.as_str()) {
                    sqlx::query("UPDATE messages SET active_child_index = ? WHERE message_id = ?")
                        .bind(pos as i64)
                        .bind(parent_id.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        sqlx::query("UPDATE chats SET timestamp_updated = ? WHERE chat_id = ?")
            .bind(timestamp)
            .bind(chat_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(message_id)
    }

    async fn get_message(&self, id: &MessageId) -> CoreResult<Option<Message>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"SELECT message_id, chat_id, role, body, model_name, timestamp_ms, parent_message_id,
                      active_child_index, tool_call_id, tool_calls, thinking_content
               FROM messages WHERE message_id = ?"#,
        )
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let mut message = Self::row_to_message(&row)?;
        message.attachments = self.fetch_attachments(&mut conn, id.as_str()).await?;
        message.child_message_ids = self
            .fetch_children_ids(&mut conn, id.as_str())
            .await?
            .into_iter()
            .map(MessageId)
            .collect();
        Ok(Some(message))
    }

    async fn list_messages(&self, chat_id: &ChatId) -> CoreResult<Vec<Message>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"SELECT message_id, chat_id, role, body, model_name, timestamp_ms, parent_message_id,
                      active_child_index, tool_call_id, tool_calls, thinking_content
               FROM messages WHERE chat_id = ? ORDER BY timestamp_ms, insertion_seq"#,
        )
        .bind(chat_id.as_str())
        .fetch_all(&mut *conn)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut message = Self::row_to_message(&row)?;
            let id = message.message_id.as_str().to_string();
            message.attachments = self.fetch_attachments(&mut conn, &id).await?;
            message.child_message_ids = self
                .fetch_children_ids(&mut conn, &id)
                .await?
                .into_iter()
                .map(MessageId)
                .collect();
            out.push(message);
        }
        Ok(out)
    }

    async fn edit_message(&self, chat_id: &ChatId, id: &MessageId, args: EditMessageArgs) -> CoreResult<()> {
        let tool_calls_json = match &args.tool_calls {
            Some(calls) => Some(serde_json::to_string(calls)?),
            None => None,
        };

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE messages SET body = ?, model_name = ?, tool_calls = ? WHERE message_id = ? AND chat_id = ?",
        )
        .bind(&args.body)
        .bind(&args.model_name)
        .bind(&tool_calls_json)
        .bind(id.as_str())
        .bind(chat_id.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("message {id} not found in chat {chat_id}")));
        }

        sqlx::query("DELETE FROM attachments WHERE message_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        for attachment in &args.attachments {
            sqlx::query(
                "INSERT INTO attachments (attachment_id, message_id, kind, content, name) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(AttachmentId::new().as_str())
            .bind(id.as_str())
            .bind(attachment.kind.as_str())
            .bind(&attachment.content)
            .bind(&attachment.name)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE chats SET timestamp_updated = ? WHERE chat_id = ?")
            .bind(now_ms())
            .bind(chat_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: &ChatId, id: &MessageId) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let parent_row = sqlx::query("SELECT parent_message_id FROM messages WHERE message_id = ? AND chat_id = ?")
            .bind(id.as_str())
            .bind(chat_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(parent_row) = parent_row else {
            return Err(CoreError::not_found(format!("message {id} not found in chat {chat_id}")));
        };
        let parent_id: Option<String> = parent_row.get("parent_message_id");

        // FK ON DELETE CASCADE (messages->messages, attachments->messages) takes
        // care of descendants and attachments in one statement.
        sqlx::query("DELETE FROM messages WHERE message_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        if let Some(parent_id) = parent_id {
            let remaining = sqlx::query("SELECT message_id FROM messages WHERE parent_message_id = ? ORDER BY timestamp_ms, insertion_seq")
                .bind(&parent_id)
                .fetch_all(&mut *tx)
                .await?;
            let new_index = clamp_active_index(i64::MAX, remaining.len());
            sqlx::query("UPDATE messages SET active_child_index = ? WHERE message_id = ?")
                .bind(new_index)
                .bind(&parent_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE chats SET timestamp_updated = ? WHERE chat_id = ?")
            .bind(now_ms())
            .bind(chat_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_active_branch(&self, parent_id: &MessageId, index: i64) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let parent_row = sqlx::query("SELECT chat_id FROM messages WHERE message_id = ?")
            .bind(parent_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(parent_row) = parent_row else {
            return Err(CoreError::not_found(format!("message {parent_id} not found")));
        };
        let chat_id: String = parent_row.get("chat_id");

        let children = sqlx::query(
            "SELECT message_id FROM messages WHERE parent_message_id = ? ORDER BY timestamp_ms, insertion_seq",
        )
        .bind(parent_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        if children.is_empty() {
            return Err(CoreError::bad_request(format!(
                "message {parent_id} has no children to select a branch among"
            )));
        }
        if index < 0 || index as usize >= children.len() {
            return Err(CoreError::bad_request(format!(
                "branch index {index} out of range [0, {})",
                children.len()
            )));
        }

        sqlx::query("UPDATE messages SET active_child_index = ? WHERE message_id = ?")
            .bind(index)
            .bind(parent_id.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE chats SET timestamp_updated = ? WHERE chat_id = ?")
            .bind(now_ms())
            .bind(&chat_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

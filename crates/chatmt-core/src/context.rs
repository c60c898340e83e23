//! The Context Builder: walks a chat's active branch up to a target message
//! and emits a provider-neutral sequence of entries.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::model::{Message, MessageId, Role, ToolCallPayload};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NeutralAttachment {
    pub kind: String,
    pub content: String,
    pub name: Option<String>,
}

/// One provider-neutral history entry. Fields that would be null/empty are
/// simply absent rather than serialized as `null`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NeutralEntry {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<NeutralAttachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub system_prompt: Option<String>,
    pub cot_start_tag: Option<String>,
    pub cot_end_tag: Option<String>,
    pub preserve_thinking: bool,
}

struct Node<'a> {
    message: &'a Message,
    children_ids: Vec<&'a MessageId>,
}

/// Builds the neutral context for `chat_id`'s active branch, stopping after
/// (and including) `stop_at`. `all_messages` must contain every message of
/// the chat; callers typically obtain it from `MessageStore::list_messages`.
pub fn build_context(
    all_messages: &[Message],
    stop_at: &MessageId,
    opts: &ContextOptions,
) -> CoreResult<Vec<NeutralEntry>> {
    let mut context = Vec::new();

    if let Some(prompt) = &opts.system_prompt {
        context.push(NeutralEntry {
            role: "system".into(),
            body: Some(prompt.clone()),
            ..Default::default()
        });
    }

    if all_messages.is_empty() {
        return Ok(context);
    }

    let mut by_id: HashMap<&str, Node> = HashMap::new();
    let mut roots: Vec<&Message> = Vec::new();

    for m in all_messages {
        by_id.insert(m.message_id.as_str(), Node { message: m, children_ids: Vec::new() });
    }
    for m in all_messages {
        if let Some(parent) = &m.parent_message_id {
            if by_id.contains_key(parent.as_str()) {
                by_id.get_mut(parent.as_str()).unwrap().children_ids.push(&m.message_id);
            }
        } else {
            roots.push(m);
        }
    }
    // `all_messages` is already in the store's canonical
    // `(timestamp_ms, insertion_seq)` order (see `MessageStore::list_messages`),
    // which is what `active_child_index` is computed against. Re-sorting here
    // by message id would pick a different active child on timestamp ties,
    // so roots/children are built by preserving that input order rather than
    // sorted again.

    let think_patterns = cot_strip_patterns(opts);

    let mut found = false;
    for root in &roots {
        if found {
            break;
        }
        found = traverse_active(root.message_id.as_str(), &by_id, stop_at, opts, &think_patterns, &mut context)?;
    }

    Ok(context)
}

fn cot_strip_patterns(opts: &ContextOptions) -> Vec<(String, String, Regex)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let custom = (
        opts.cot_start_tag.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        opts.cot_end_tag.as_deref().map(str::trim).filter(|s| !s.is_empty()),
    );
    if let (Some(start), Some(end)) = custom {
        pairs.push((start.to_string(), end.to_string()));
    }
    if !pairs.iter().any(|(s, e)| s == "<think>" && e == "</think>") {
        pairs.push(("<think>".to_string(), "</think>".to_string()));
    }
    pairs
        .into_iter()
        .map(|(start, end)| {
            let pattern = format!("(?s){}.*?{}\\s*", regex::escape(&start), regex::escape(&end));
            (start, end, Regex::new(&pattern).expect("valid generated regex"))
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn traverse_active(
    message_id: &str,
    by_id: &HashMap<&str, Node>,
    stop_at: &MessageId,
    opts: &ContextOptions,
    think_patterns: &[(String, String, Regex)],
    context: &mut Vec<NeutralEntry>,
) -> CoreResult<bool> {
    let Some(node) = by_id.get(message_id) else {
        return Ok(false);
    };
    let msg = node.message;

    let context_role = match msg.role {
        Role::Assistant => "assistant",
        Role::User => "user",
        Role::System => "system",
        Role::Tool => "tool",
    };

    let mut body = msg.body.clone();
    if msg.role == Role::Assistant {
        if opts.preserve_thinking {
            if let Some(thinking) = &msg.thinking_content {
                if !thinking.is_empty() {
                    let start = opts.cot_start_tag.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or("<think>");
                    let end = opts.cot_end_tag.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or("</think>");
                    body = format!("{start}{thinking}{end}\n{body}");
                }
            }
        } else {
            for (_, _, pattern) in think_patterns {
                body = pattern.replace_all(&body, "").to_string();
            }
            body = body.trim().to_string();
        }
    }

    let mut entry = NeutralEntry {
        role: context_role.to_string(),
        body: if body.is_empty() { None } else { Some(body) },
        attachments: msg
            .attachments
            .iter()
            .map(|a| NeutralAttachment {
                kind: a.kind.as_str().to_string(),
                content: a.content.clone(),
                name: a.name.clone(),
            })
            .collect(),
        tool_calls: if context_role == "assistant" { msg.tool_calls.clone() } else { None },
        tool_call_id: if context_role == "tool" { msg.tool_call_id.clone() } else { None },
    };

    if context_role == "tool" && entry.body.is_none() {
        entry.body = Some("[Tool Execution Result Missing]".to_string());
    }
    if context_role == "assistant" && entry.tool_calls.is_some() && entry.body.is_none() {
        entry.body = Some(String::new());
    }

    let is_empty_entry = entry.body.is_none() && entry.attachments.is_empty() && entry.tool_calls.is_none();
    if !is_empty_entry {
        context.push(entry);
    }

    if message_id == stop_at.as_str() {
        return Ok(true);
    }

    if !node.children_ids.is_empty() {
        let active_idx = crate::store::clamp_active_index(msg.active_child_index, node.children_ids.len());
        let chosen = node.children_ids[active_idx as usize];
        if traverse_active(chosen.as_str(), by_id, stop_at, opts, think_patterns, context)? {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attachment, AttachmentKind, ChatId};

    fn msg(id: &str, parent: Option<&str>, role: Role, body: &str, ts: i64) -> Message {
        Message {
            message_id: MessageId::from(id),
            chat_id: ChatId::from("c1"),
            role,
            body: body.to_string(),
            model_name: None,
            timestamp_ms: ts,
            parent_message_id: parent.map(MessageId::from),
            active_child_index: 0,
            tool_call_id: None,
            tool_calls: None,
            thinking_content: None,
            attachments: Vec::new(),
            child_message_ids: Vec::new(),
        }
    }

    #[test]
    fn builds_linear_context_with_system_prompt_first() {
        let messages = vec![
            msg("u1", None, Role::User, "2+2=", 1),
            msg("a1", Some("u1"), Role::Assistant, "4", 2),
        ];
        let opts = ContextOptions {
            system_prompt: Some("be terse".into()),
            ..Default::default()
        };
        let ctx = build_context(&messages, &MessageId::from("a1"), &opts).unwrap();
        assert_eq!(ctx[0].role, "system");
        assert_eq!(ctx[1].role, "user");
        assert_eq!(ctx[2].role, "assistant");
        assert_eq!(ctx[2].body.as_deref(), Some("4"));
    }

    #[test]
    fn stops_at_target_message_even_with_further_descendants() {
        let messages = vec![
            msg("u1", None, Role::User, "hi", 1),
            msg("a1", Some("u1"), Role::Assistant, "first", 2),
            msg("u2", Some("a1"), Role::User, "second turn", 3),
        ];
        let opts = ContextOptions::default();
        let ctx = build_context(&messages, &MessageId::from("a1"), &opts).unwrap();
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.last().unwrap().body.as_deref(), Some("first"));
    }

    #[test]
    fn strips_default_think_tags_when_not_preserving_thinking() {
        let messages = vec![
            msg("u1", None, Role::User, "hi", 1),
            msg("a1", Some("u1"), Role::Assistant, "<think>pondering</think>final answer", 2),
        ];
        let opts = ContextOptions::default();
        let ctx = build_context(&messages, &MessageId::from("a1"), &opts).unwrap();
        assert_eq!(ctx.last().unwrap().body.as_deref(), Some("final answer"));
    }

    #[test]
    fn descends_through_active_child_index_not_first_child() {
        let mut sibling_a = msg("a1", Some("u1"), Role::Assistant, "one", 2);
        let sibling_b = msg("a2", Some("u1"), Role::Assistant, "two", 3);
        let mut root = msg("u1", None, Role::User, "hi", 1);
        root.active_child_index = 1; // select a2, not a1
        sibling_a.active_child_index = 0;
        let messages = vec![root, sibling_a, sibling_b];
        let ctx = build_context(&messages, &MessageId::from("a2"), &ContextOptions::default()).unwrap();
        assert_eq!(ctx.last().unwrap().body.as_deref(), Some("two"));
    }

    #[test]
    fn tool_entry_gets_placeholder_body_when_empty() {
        let mut tool_msg = msg("t1", Some("a1"), Role::Tool, "", 3);
        tool_msg.tool_call_id = Some("call_1".into());
        let messages = vec![
            msg("u1", None, Role::User, "hi", 1),
            msg("a1", Some("u1"), Role::Assistant, "", 2),
            tool_msg,
        ];
        let ctx = build_context(&messages, &MessageId::from("t1"), &ContextOptions::default()).unwrap();
        let tool_entry = ctx.iter().find(|e| e.role == "tool").unwrap();
        assert_eq!(tool_entry.body.as_deref(), Some("[Tool Execution Result Missing]"));
        assert_eq!(tool_entry.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn same_store_state_produces_byte_identical_output() {
        let messages = vec![
            msg("u1", None, Role::User, "2+2=", 1),
            msg("a1", Some("u1"), Role::Assistant, "4", 2),
        ];
        let opts = ContextOptions::default();
        let first = serde_json::to_string(&build_context(&messages, &MessageId::from("a1"), &opts).unwrap()).unwrap();
        let second = serde_json::to_string(&build_context(&messages, &MessageId::from("a1"), &opts).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn preserves_insertion_order_on_timestamp_ties() {
        // Two siblings share a millisecond timestamp; only insertion order
        // (the order they appear in `all_messages`, as the store delivers
        // it) tells them apart. `active_child_index` picks the second one.
        let mut root = msg("u1", None, Role::User, "hi", 1);
        root.active_child_index = 1;
        let sibling_a = msg("a1", Some("u1"), Role::Assistant, "one", 5);
        let sibling_b = msg("a2", Some("u1"), Role::Assistant, "two", 5);
        let messages = vec![root, sibling_a, sibling_b];
        let ctx = build_context(&messages, &MessageId::from("a2"), &ContextOptions::default()).unwrap();
        assert_eq!(ctx.last().unwrap().body.as_deref(), Some("two"));
    }

    #[test]
    fn attachments_carry_through_to_neutral_entry() {
        let mut user_msg = msg("u1", None, Role::User, "see this", 1);
        user_msg.attachments.push(Attachment {
            attachment_id: crate::model::AttachmentId::new(),
            message_id: MessageId::from("u1"),
            kind: AttachmentKind::Image,
            content: "base64data".into(),
            name: Some("pic.png".into()),
        });
        let messages = vec![user_msg];
        let ctx = build_context(&messages, &MessageId::from("u1"), &ContextOptions::default()).unwrap();
        assert_eq!(ctx[0].attachments.len(), 1);
        assert_eq!(ctx[0].attachments[0].name.as_deref(), Some("pic.png"));
    }
}

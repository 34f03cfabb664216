//! Message canonicalization and token budgeting.
//!
//! Token counts are estimated, not tokenized: four characters per token,
//! rounded up. Backends without a system role get their system turns
//! collapsed into a `[System]...[/System]` prefix on the first user turn.

use axon_types::chat::{ChatMessage, ChatRole};
use axon_types::error::EngineError;
use axon_types::model::ModelSpec;

const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of one message's content.
pub fn estimate_tokens(content: &str) -> u32 {
    content.chars().count().div_ceil(CHARS_PER_TOKEN) as u32
}

/// Estimated token count of a whole conversation.
pub fn estimate_conversation(messages: &[ChatMessage]) -> u32 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Whether the prompt plus the requested decode budget fits the model's
/// context window.
pub fn fits_context(messages: &[ChatMessage], max_tokens: u32, context_window: u32) -> bool {
    estimate_conversation(messages) + max_tokens <= context_window
}

/// Validates a request against the model spec before any provider work.
///
/// Rejects empty conversations, conversations without a user turn, and
/// models declaring a jinja chat template (the engine ships no template
/// interpreter).
pub fn validate(messages: &[ChatMessage], model: Option<&ModelSpec>) -> Result<(), EngineError> {
    if !messages.iter().any(|m| m.role == ChatRole::User) {
        return Err(EngineError::EmptyMessages);
    }
    if let Some(template) = model.and_then(|m| m.chat_template.as_ref()) {
        if template.format.eq_ignore_ascii_case("jinja") {
            return Err(EngineError::TemplateFormatUnsupported {
                format: template.format.clone(),
            });
        }
    }
    Ok(())
}

/// Collapses system turns into a prefix of the first user turn, for
/// backends without a dedicated system role.
///
/// System contents are joined in order with blank lines and wrapped in
/// `[System]`/`[/System]` markers. Idempotent: a second application is the
/// identity, because the output contains no system turns.
pub fn flatten_system(messages: &[ChatMessage]) -> Result<Vec<ChatMessage>, EngineError> {
    let system_text = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut out = Vec::with_capacity(messages.len());
    let mut system_consumed = system_text.is_empty();
    let mut saw_user = false;
    for message in messages {
        match message.role {
            ChatRole::System => continue,
            ChatRole::User if !system_consumed => {
                system_consumed = true;
                saw_user = true;
                out.push(ChatMessage::user(format!(
                    "[System]\n{system_text}\n[/System]\n\n{}",
                    message.content
                )));
            }
            ChatRole::User => {
                saw_user = true;
                out.push(message.clone());
            }
            ChatRole::Assistant => out.push(message.clone()),
        }
    }

    if !saw_user {
        return Err(EngineError::EmptyMessages);
    }
    Ok(out)
}

/// Canonicalizes a conversation for a backend: flattens system turns when
/// the backend lacks a system role, otherwise passes the turns through
/// after validation.
pub fn adapt_for_backend(
    messages: &[ChatMessage],
    supports_system_role: bool,
) -> Result<Vec<ChatMessage>, EngineError> {
    if messages.is_empty() || !messages.iter().any(|m| m.role == ChatRole::User) {
        return Err(EngineError::EmptyMessages);
    }
    if supports_system_role {
        Ok(messages.to_vec())
    } else {
        flatten_system(messages)
    }
}

//! Token estimation.
//!
//! A character-class heuristic stands in for a real tokenizer: CJK
//! characters cost 1/1.5 token, code punctuation one token each, everything
//! else 1/3.8. Per-message estimates are cached on the message and cleared
//! whenever compaction rewrites it.

use toolweave_core::message::Message;
use toolweave_core::provider::ToolDefinition;

/// Framing overhead per message (role, delimiters).
const MESSAGE_OVERHEAD: usize = 4;
/// Overhead per tool call (id, type, function wrapper).
const TOOL_CALL_OVERHEAD: usize = 8;

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}' | '\u{3000}'..='\u{303f}' | '\u{ff00}'..='\u{ffef}')
}

fn is_code_punctuation(c: char) -> bool {
    "{}[]:,;()=<>+-*/|&^~!@#$%".contains(c)
}

/// Estimate the token count of a string. Non-empty text costs at least 1.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let (mut cjk, mut code, mut other) = (0usize, 0usize, 0usize);
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else if is_code_punctuation(c) {
            code += 1;
        } else {
            other += 1;
        }
    }
    let tokens = cjk as f64 / 1.5 + code as f64 + other as f64 / 3.8;
    (tokens as usize).max(1)
}

/// Estimate one message: framing, content, tool calls and images.
pub fn estimate_message_tokens(message: &Message, image_cost: usize) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|c| estimate_tokens(&c.name) + estimate_tokens(&c.arguments) + TOOL_CALL_OVERHEAD)
        .sum();
    MESSAGE_OVERHEAD + estimate_tokens(&message.content) + calls + message.images.len() * image_cost
}

/// Like [`estimate_message_tokens`], reusing and filling the cached value.
pub fn cached_message_tokens(message: &mut Message, image_cost: usize) -> usize {
    if let Some(n) = message.token_estimate {
        return n;
    }
    let n = estimate_message_tokens(message, image_cost);
    message.token_estimate = Some(n);
    n
}

/// Sum of the cached per-message estimates.
pub fn estimate_messages_tokens(messages: &mut [Message], image_cost: usize) -> usize {
    messages
        .iter_mut()
        .map(|m| cached_message_tokens(m, image_cost))
        .sum()
}

/// Tool definitions are sent as JSON on every call.
pub fn estimate_tools_tokens(tools: &[ToolDefinition]) -> usize {
    tools
        .iter()
        .map(|t| estimate_tokens(&serde_json::to_string(t).unwrap_or_default()))
        .sum()
}

//! Round reconstruction over a flat message history.
//!
//! A round starts at a user message and runs until the next user message.
//! Leading system messages form the preamble and belong to no round.

use crate::message::{Message, Role};
use std::collections::HashSet;
use std::ops::Range;

/// Number of leading system messages.
pub fn preamble_len(messages: &[Message]) -> usize {
    messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count()
}

/// Split a history into rounds, returned as index ranges into `messages`.
///
/// Every non-preamble message lands in exactly one range and the ranges are
/// contiguous and ordered. A run of non-user messages before the first user
/// message forms its own round.
pub fn split_rounds(messages: &[Message]) -> Vec<Range<usize>> {
    let start = preamble_len(messages);
    let mut rounds = Vec::new();
    let mut current: Option<usize> = None;

    for (i, msg) in messages.iter().enumerate().skip(start) {
        match current {
            None => current = Some(i),
            Some(begin) if msg.role == Role::User => {
                rounds.push(begin..i);
                current = Some(i);
            }
            Some(_) => {}
        }
    }

    if let Some(begin) = current {
        rounds.push(begin..messages.len());
    }
    rounds
}

/// Repair a history so every tool message answers a preceding tool call and
/// every tool call has an answer.
///
/// Returns how many messages were removed or synthesized.
pub fn sanitize(messages: &mut Vec<Message>) -> usize {
    let mut fixes = 0;
    let mut pending: Vec<String> = Vec::new();
    let mut known: HashSet<String> = HashSet::new();
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());

    let flush = |pending: &mut Vec<String>, out: &mut Vec<Message>, fixes: &mut usize| {
        for id in pending.drain(..) {
            out.push(Message::tool_result(id, "[no result recorded]"));
            *fixes += 1;
        }
    };

    for msg in messages.drain(..) {
        match msg.role {
            Role::Tool => {
                let answered = msg
                    .tool_call_id
                    .as_ref()
                    .filter(|id| known.contains(*id))
                    .cloned();
                match answered {
                    Some(id) => {
                        pending.retain(|p| p != &id);
                        known.remove(&id);
                        out.push(msg);
                    }
                    None => fixes += 1,
                }
            }
            Role::Assistant => {
                flush(&mut pending, &mut out, &mut fixes);
                known.clear();
                for call in &msg.tool_calls {
                    pending.push(call.id.clone());
                    known.insert(call.id.clone());
                }
                out.push(msg);
            }
            Role::User | Role::System => {
                flush(&mut pending, &mut out, &mut fixes);
                known.clear();
                out.push(msg);
            }
        }
    }
    flush(&mut pending, &mut out, &mut fixes);

    *messages = out;
    fixes
}

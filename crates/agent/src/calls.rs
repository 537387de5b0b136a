//! Tool-call normalization and per-turn deduplication.

use serde_json::{Map, Value};
use toolweave_core::message::MessageToolCall;
use toolweave_core::tool::ToolCall;

/// Fill missing ids and repair argument JSON.
///
/// Ids the provider omitted become `call_<iteration>_<index>`. Arguments that
/// do not parse as a JSON object are salvaged from the first balanced
/// `{...}` in the text, falling back to `{}`. The returned message calls carry
/// the repaired JSON so the history stays well-formed.
pub fn normalize_tool_calls(raw: Vec<MessageToolCall>, iteration: usize) -> (Vec<MessageToolCall>, Vec<ToolCall>) {
    let mut message_calls = Vec::with_capacity(raw.len());
    let mut calls = Vec::with_capacity(raw.len());

    for (index, mut call) in raw.into_iter().enumerate() {
        if call.id.trim().is_empty() {
            call.id = format!("call_{iteration}_{index}");
        }
        let arguments = parse_arguments(&call.arguments);
        call.arguments = arguments.to_string();
        calls.push(ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        });
        message_calls.push(call);
    }
    (message_calls, calls)
}

/// Parse tool arguments into a JSON object, repairing what can be repaired.
pub fn parse_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Map::new());
    }
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    first_balanced_object(trimmed)
        .and_then(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// The first `{...}` span with balanced braces, ignoring braces in strings.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Order-insensitive rendering of a JSON value: object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Which calls of a turn actually run.
///
/// `unique` holds the first call of every `(name, arguments)` pair in issue
/// order; `slots[i]` is the index into `unique` answering call `i`.
#[derive(Debug, Clone)]
pub struct DedupPlan {
    pub unique: Vec<ToolCall>,
    pub slots: Vec<usize>,
    first: Vec<usize>,
}

impl DedupPlan {
    pub fn build(calls: &[ToolCall]) -> Self {
        let mut keys: Vec<String> = Vec::new();
        let mut unique = Vec::new();
        let mut slots = Vec::with_capacity(calls.len());
        let mut first = Vec::new();

        for (i, call) in calls.iter().enumerate() {
            let key = format!("{}\u{0}{}", call.name, canonical_json(&call.arguments));
            match keys.iter().position(|k| *k == key) {
                Some(slot) => slots.push(slot),
                None => {
                    keys.push(key);
                    unique.push(call.clone());
                    first.push(i);
                    slots.push(unique.len() - 1);
                }
            }
        }
        Self { unique, slots, first }
    }

    /// Whether call `i` reuses an earlier call's result.
    pub fn is_duplicate(&self, i: usize) -> bool {
        self.first[self.slots[i]] != i
    }

    pub fn duplicates(&self) -> usize {
        self.slots.len() - self.unique.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(id: &str, name: &str, args: &str) -> MessageToolCall {
        MessageToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    #[test]
    fn fills_missing_ids() {
        let (msgs, calls) = normalize_tool_calls(vec![raw("", "a", "{}"), raw("x", "b", "{}")], 3);
        assert_eq!(msgs[0].id, "call_3_0");
        assert_eq!(calls[0].id, "call_3_0");
        assert_eq!(calls[1].id, "x");
    }

    #[test]
    fn repairs_arguments() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments(r#"{"a": 1}"#), json!({"a": 1}));
        assert_eq!(
            parse_arguments(r#"Sure: {"path": "/a/{b}", "n": {"x": 2}} trailing"#),
            json!({"path": "/a/{b}", "n": {"x": 2}})
        );
        assert_eq!(parse_arguments(r#"{"a": 1"#), json!({}));
        assert_eq!(parse_arguments("[1, 2]"), json!({}));
    }

    #[test]
    fn repaired_json_is_written_back() {
        let (msgs, _) = normalize_tool_calls(vec![raw("c", "a", "junk {\"k\":true} junk")], 1);
        assert_eq!(msgs[0].arguments, r#"{"k":true}"#);
    }

    #[test]
    fn canonical_form_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, {"d": 0, "c": 1}], "x": "s"}});
        let b = json!({"a": {"x": "s", "y": [1, {"c": 1, "d": 0}]}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_ne!(canonical_json(&json!({"a": 1})), canonical_json(&json!({"a": 2})));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let calls = vec![
            call("1", "get", json!({"k": "a", "n": 1})),
            call("2", "get", json!({"n": 1, "k": "a"})),
            call("3", "get", json!({"k": "b"})),
            call("4", "set", json!({"k": "a", "n": 1})),
        ];
        let plan = DedupPlan::build(&calls);
        assert_eq!(plan.unique.len(), 3);
        assert_eq!(plan.slots, vec![0, 0, 1, 2]);
        assert!(!plan.is_duplicate(0));
        assert!(plan.is_duplicate(1));
        assert!(!plan.is_duplicate(3));
        assert_eq!(plan.duplicates(), 1);
    }
}

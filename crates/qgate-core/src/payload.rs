use serde_json::{json, Value as JsonValue};

/// Injected when the caller supplies no system message.
const DEFAULT_SYSTEM_PROMPT: &str = "你是助手";

/// Prepare an outbound chat payload: ensure a system message exists, then mark
/// the system message and the last message with the upstream prompt-cache hint
/// (`cache_control: {type: "ephemeral"}` on the last text part).
///
/// The payload is otherwise treated as an opaque pass-through document.
pub fn prepare_chat_payload(payload: &mut JsonValue) {
    let Some(messages) = payload.get_mut("messages").and_then(JsonValue::as_array_mut) else {
        return;
    };

    let has_system = messages
        .iter()
        .any(|m| m.get("role").and_then(JsonValue::as_str) == Some("system"));
    if !has_system {
        messages.insert(
            0,
            json!({ "role": "system", "content": DEFAULT_SYSTEM_PROMPT }),
        );
    }

    let system_index = messages
        .iter()
        .position(|m| m.get("role").and_then(JsonValue::as_str) == Some("system"));
    if let Some(index) = system_index {
        mark_cache_control(&mut messages[index]);
    }

    let last = messages.len().saturating_sub(1);
    if Some(last) != system_index {
        if let Some(message) = messages.get_mut(last) {
            mark_cache_control(message);
        }
    }
}

/// Attach the ephemeral cache hint to the last text part of a message.
/// String content is promoted to a one-element text-part array first.
fn mark_cache_control(message: &mut JsonValue) {
    let Some(content) = message.get_mut("content") else {
        return;
    };

    match content {
        JsonValue::String(text) => {
            *content = json!([{
                "type": "text",
                "text": text,
                "cache_control": { "type": "ephemeral" },
            }]);
        }
        JsonValue::Array(parts) => {
            let last_text = parts
                .iter_mut()
                .rev()
                .find(|p| p.get("type").and_then(JsonValue::as_str) == Some("text"));
            if let Some(part) = last_text {
                if let Some(obj) = part.as_object_mut() {
                    obj.insert(
                        "cache_control".to_string(),
                        json!({ "type": "ephemeral" }),
                    );
                }
            }
        }
        _ => {}
    }
}

/// True when the caller asked for a server-sent-event response.
pub fn wants_stream(payload: &JsonValue) -> bool {
    payload.get("stream").and_then(JsonValue::as_bool) == Some(true)
}

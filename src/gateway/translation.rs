//! Request-body translation between provider wire dialects.
//!
//! Each translator is a pure function registered for a `(source, destination)` pair; adding a
//! provider dialect means registering another function, not branching in the forwarder.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("request body must be a json object")]
    NotAnObject,
    #[error("no translation from {from:?} to {to:?}")]
    Unsupported { from: Dialect, to: Dialect },
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

pub type TranslateFn = fn(Value) -> Result<Value, TranslationError>;

pub struct DialectRegistry {
    translators: HashMap<(Dialect, Dialect), TranslateFn>,
}

impl Default for DialectRegistry {
    fn default() -> Self {
        let mut registry = Self {
            translators: HashMap::new(),
        };
        registry.register(Dialect::OpenAi, Dialect::Anthropic, openai_to_anthropic);
        registry
    }
}

impl DialectRegistry {
    pub fn register(&mut self, from: Dialect, to: Dialect, translate: TranslateFn) {
        self.translators.insert((from, to), translate);
    }

    pub fn translate(
        &self,
        from: Dialect,
        to: Dialect,
        body: Value,
    ) -> Result<Value, TranslationError> {
        if from == to {
            return Ok(body);
        }
        let translate = self
            .translators
            .get(&(from, to))
            .ok_or(TranslationError::Unsupported { from, to })?;
        translate(body)
    }
}

const DEFAULT_MAX_TOKENS: u64 = 4096;

/// OpenAI chat completions -> Anthropic messages.
pub fn openai_to_anthropic(body: Value) -> Result<Value, TranslationError> {
    let Value::Object(source) = body else {
        return Err(TranslationError::NotAnObject);
    };

    let raw_messages = match source.get("messages") {
        Some(Value::Array(messages)) => messages.as_slice(),
        Some(_) => {
            return Err(TranslationError::InvalidField {
                field: "messages",
                reason: "expected an array".to_string(),
            });
        }
        None => &[],
    };

    let mut system = Vec::<String>::new();
    let mut messages = Vec::<Value>::new();
    for message in raw_messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        match role {
            "system" | "developer" => {
                if let Some(text) = content_text(message.get("content")) {
                    system.push(text);
                }
            }
            "tool" => {
                let tool_use_id = message
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let block = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content_text(message.get("content")).unwrap_or_default(),
                });
                push_blocks(&mut messages, "user", vec![block]);
            }
            "assistant" => {
                let mut blocks = content_blocks(message.get("content"));
                if let Some(Value::Array(calls)) = message.get("tool_calls") {
                    for call in calls {
                        blocks.push(tool_call_block(call)?);
                    }
                }
                push_blocks(&mut messages, "assistant", blocks);
            }
            _ => {
                let blocks = content_blocks(message.get("content"));
                push_blocks(&mut messages, "user", blocks);
            }
        }
    }

    let mut out = Map::<String, Value>::new();
    if let Some(model) = source.get("model") {
        out.insert("model".to_string(), model.clone());
    }
    out.insert("messages".to_string(), Value::Array(messages));
    let max_tokens = source
        .get("max_completion_tokens")
        .or_else(|| source.get("max_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_TOKENS);
    out.insert("max_tokens".to_string(), Value::Number(max_tokens.into()));
    if !system.is_empty() {
        out.insert("system".to_string(), Value::String(system.join("\n\n")));
    }

    for field in ["temperature", "top_p", "top_k", "stream"] {
        if let Some(value) = source.get(field).filter(|value| !value.is_null()) {
            out.insert(field.to_string(), value.clone());
        }
    }

    match source.get("stop") {
        Some(Value::String(stop)) => {
            out.insert(
                "stop_sequences".to_string(),
                Value::Array(vec![Value::String(stop.clone())]),
            );
        }
        Some(Value::Array(stops)) if !stops.is_empty() => {
            out.insert("stop_sequences".to_string(), Value::Array(stops.clone()));
        }
        _ => {}
    }

    if let Some(Value::Array(tools)) = source.get("tools") {
        let tools = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                let name = function.get("name")?.clone();
                let mut out = Map::<String, Value>::new();
                out.insert("name".to_string(), name);
                if let Some(description) = function.get("description") {
                    out.insert("description".to_string(), description.clone());
                }
                out.insert(
                    "input_schema".to_string(),
                    function
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
                );
                Some(Value::Object(out))
            })
            .collect::<Vec<_>>();
        if !tools.is_empty() {
            out.insert("tools".to_string(), Value::Array(tools));
        }
    }

    if let Some(choice) = source.get("tool_choice").and_then(tool_choice_to_anthropic) {
        out.insert("tool_choice".to_string(), choice);
    }

    if let Some(user) = source.get("user").and_then(Value::as_str) {
        out.insert(
            "metadata".to_string(),
            serde_json::json!({ "user_id": user }),
        );
    }

    Ok(Value::Object(out))
}

fn tool_choice_to_anthropic(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Some(serde_json::json!({ "type": "auto" })),
            "required" => Some(serde_json::json!({ "type": "any" })),
            "none" => Some(serde_json::json!({ "type": "none" })),
            _ => None,
        },
        Value::Object(_) => {
            let name = choice.get("function")?.get("name")?.as_str()?;
            Some(serde_json::json!({ "type": "tool", "name": name }))
        }
        _ => None,
    }
}

fn tool_call_block(call: &Value) -> Result<Value, TranslationError> {
    let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
    let function = call.get("function").cloned().unwrap_or(Value::Null);
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let input = match function.get("arguments") {
        Some(Value::String(raw)) if !raw.trim().is_empty() => {
            serde_json::from_str::<Value>(raw).map_err(|err| TranslationError::InvalidField {
                field: "tool_calls.function.arguments",
                reason: err.to_string(),
            })?
        }
        Some(Value::Object(args)) => Value::Object(args.clone()),
        _ => Value::Object(Map::new()),
    };
    Ok(serde_json::json!({
        "type": "tool_use",
        "id": id,
        "name": name,
        "input": input,
    }))
}

/// Anthropic rejects consecutive turns with the same role, so they are merged.
fn push_blocks(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut() {
        if last.get("role").and_then(Value::as_str) == Some(role) {
            if let Some(Value::Array(content)) = last.get_mut("content") {
                content.extend(blocks);
                return;
            }
        }
    }
    messages.push(serde_json::json!({ "role": role, "content": blocks }));
}

fn content_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let text = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

fn content_blocks(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::String(text)) if !text.is_empty() => {
            vec![serde_json::json!({ "type": "text", "text": text })]
        }
        Some(Value::Array(parts)) => parts.iter().filter_map(content_part_block).collect(),
        _ => Vec::new(),
    }
}

fn content_part_block(part: &Value) -> Option<Value> {
    match part.get("type").and_then(Value::as_str)? {
        "text" => {
            let text = part.get("text")?.as_str()?;
            Some(serde_json::json!({ "type": "text", "text": text }))
        }
        "image_url" => {
            let url = part
                .get("image_url")
                .and_then(|image| image.get("url").or(Some(image)))
                .and_then(Value::as_str)?;
            if let Some(data) = url.strip_prefix("data:") {
                let (media_type, encoded) = data.split_once(";base64,")?;
                Some(serde_json::json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": media_type, "data": encoded },
                }))
            } else {
                Some(serde_json::json!({
                    "type": "image",
                    "source": { "type": "url", "url": url },
                }))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_messages_move_to_the_system_field() {
        let body = json!({
            "model": "claude-3-haiku",
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "hi" }
            ],
            "max_tokens": 64,
            "temperature": 0.2,
            "stop": "END"
        });
        let out = openai_to_anthropic(body).unwrap();
        assert_eq!(out["system"], "be brief");
        assert_eq!(out["max_tokens"], 64);
        assert_eq!(out["temperature"], 0.2);
        assert_eq!(out["stop_sequences"], json!(["END"]));
        assert_eq!(
            out["messages"],
            json!([{ "role": "user", "content": [{ "type": "text", "text": "hi" }] }])
        );
    }

    #[test]
    fn tool_calls_and_results_become_blocks() {
        let body = json!({
            "messages": [
                { "role": "user", "content": "weather?" },
                {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "get_weather", "arguments": "{\"city\":\"Paris\"}" }
                    }]
                },
                { "role": "tool", "tool_call_id": "call_1", "content": "sunny" },
                { "role": "user", "content": "thanks" }
            ],
            "tools": [{
                "type": "function",
                "function": { "name": "get_weather", "parameters": { "type": "object" } }
            }],
            "tool_choice": "required"
        });
        let out = openai_to_anthropic(body).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["input"]["city"], "Paris");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][1]["text"], "thanks");
        assert_eq!(out["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(out["tool_choice"], json!({ "type": "any" }));
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn data_url_images_become_base64_sources() {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "image_url", "image_url": { "url": "data:image/png;base64,AAAA" } }
                ]
            }]
        });
        let out = openai_to_anthropic(body).unwrap();
        assert_eq!(
            out["messages"][0]["content"][0]["source"],
            json!({ "type": "base64", "media_type": "image/png", "data": "AAAA" })
        );
    }

    #[test]
    fn registry_passes_same_dialect_through_and_rejects_unknown_pairs() {
        let registry = DialectRegistry::default();
        let body = json!({ "model": "gpt-4o" });
        assert_eq!(
            registry
                .translate(Dialect::OpenAi, Dialect::OpenAi, body.clone())
                .unwrap(),
            body
        );
        assert!(matches!(
            registry.translate(Dialect::Anthropic, Dialect::OpenAi, body),
            Err(TranslationError::Unsupported { .. })
        ));
    }
}

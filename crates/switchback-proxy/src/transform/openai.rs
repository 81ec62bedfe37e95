//! Into OpenAI Chat Completions shape.

use super::{rename_field, str_field, Transformer};
use crate::body::text_segments;
use crate::error::TransformError;
use crate::provider::WireFormat;
use serde_json::{json, Map, Value};

/// Anthropic-only request fields with no Chat Completions counterpart.
const DROPPED_REQUEST_FIELDS: &[&str] = &["metadata", "thinking"];

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiTransformer;

impl Transformer for OpenAiTransformer {
    fn target(&self) -> WireFormat {
        WireFormat::OpenAi
    }

    fn transform_request_value(
        &self,
        mut body: Map<String, Value>,
    ) -> Result<Value, TransformError> {
        rename_field(&mut body, "max_tokens", "max_completion_tokens");
        rename_field(&mut body, "stop_sequences", "stop");
        for field in DROPPED_REQUEST_FIELDS {
            body.remove(*field);
        }

        if let Some(Value::Array(tools)) = body.get_mut("tools") {
            for tool in tools.iter_mut() {
                convert_tool(tool);
            }
        }
        if let Some(choice) = body.remove("tool_choice") {
            body.insert("tool_choice".to_string(), convert_tool_choice(choice));
        }

        let mut messages = Vec::new();
        if let Some(system) = body.remove("system") {
            let text = text_segments(&system).collect::<Vec<_>>().join("\n");
            if !text.is_empty() {
                messages.push(json!({"role": "system", "content": text}));
            }
        }
        if let Some(Value::Array(inbound)) = body.remove("messages") {
            for message in inbound {
                convert_message(message, &mut messages);
            }
        }
        body.insert("messages".to_string(), Value::Array(messages));

        Ok(Value::Object(body))
    }

    fn transform_response_value(
        &self,
        body: Map<String, Value>,
    ) -> Result<Value, TransformError> {
        let content = body
            .get("content")
            .and_then(Value::as_array)
            .ok_or(TransformError::MissingField("content"))?;

        let text = content
            .iter()
            .find(|block| str_field(block, "type") == Some("text"))
            .and_then(|block| block.get("text").cloned())
            .unwrap_or(Value::Null);

        let tool_calls: Vec<Value> = content
            .iter()
            .filter(|block| str_field(block, "type") == Some("tool_use"))
            .map(|block| {
                let arguments = block
                    .get("input")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "{}".to_string());
                json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": arguments,
                    }
                })
            })
            .collect();

        let mut message = json!({"role": "assistant", "content": text});
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }

        let finish_reason = match body.get("stop_reason") {
            Some(Value::String(reason)) => Value::String(map_stop_reason(reason).to_string()),
            Some(other) => other.clone(),
            None => Value::Null,
        };

        let mut out = json!({
            "id": body.get("id").cloned().unwrap_or(Value::Null),
            "object": "chat.completion",
            "created": 0,
            "model": body.get("model").cloned().unwrap_or(Value::Null),
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": finish_reason,
            }],
        });

        if let Some(usage) = body.get("usage") {
            let prompt = usage
                .get("input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let completion = usage
                .get("output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            out["usage"] = json!({
                "prompt_tokens": prompt,
                "completion_tokens": completion,
                "total_tokens": prompt + completion,
            });
        }

        Ok(out)
    }
}

fn map_stop_reason(reason: &str) -> &str {
    match reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
}

/// `{name, description, input_schema}` -> `{type: function, function: {...}}`.
/// Tools without an input schema (server-side tools) are left alone.
fn convert_tool(tool: &mut Value) {
    let Some(obj) = tool.as_object_mut() else {
        return;
    };
    let Some(schema) = obj.remove("input_schema") else {
        return;
    };
    let mut function = Map::new();
    if let Some(name) = obj.remove("name") {
        function.insert("name".to_string(), name);
    }
    if let Some(description) = obj.remove("description") {
        function.insert("description".to_string(), description);
    }
    function.insert("parameters".to_string(), schema);
    *tool = json!({"type": "function", "function": function});
}

fn convert_tool_choice(choice: Value) -> Value {
    match str_field(&choice, "type") {
        Some("auto") => json!("auto"),
        Some("any") => json!("required"),
        Some("none") => json!("none"),
        Some("tool") => json!({
            "type": "function",
            "function": {"name": choice.get("name").cloned().unwrap_or(Value::Null)}
        }),
        _ => choice,
    }
}

/// Split one Anthropic message into Chat Completions messages. Tool results
/// become `role: tool` messages, emitted before any remaining user content
/// so they directly follow the assistant turn that requested them.
fn convert_message(message: Value, out: &mut Vec<Value>) {
    let role = str_field(&message, "role").unwrap_or("user").to_string();
    let Some(blocks) = message.get("content").and_then(Value::as_array).cloned() else {
        out.push(message);
        return;
    };

    let mut parts: Vec<Value> = Vec::new();
    let mut has_image = false;
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match str_field(&block, "type") {
            Some("text") => {
                let text = block.get("text").cloned().unwrap_or(Value::Null);
                parts.push(json!({"type": "text", "text": text}));
            }
            Some("image") => {
                if let Some(url) = image_url(&block) {
                    has_image = true;
                    parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
            }
            Some("tool_use") => {
                let arguments = block
                    .get("input")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "{}".to_string());
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": arguments,
                    }
                }));
            }
            Some("tool_result") => {
                let content = block
                    .get("content")
                    .map(|c| text_segments(c).collect::<Vec<_>>().join("\n"))
                    .unwrap_or_default();
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                    "content": content,
                }));
            }
            // thinking / redacted_thinking have no Chat Completions form
            _ => {}
        }
    }

    let content = if has_image {
        Value::Array(parts)
    } else if !parts.is_empty() {
        let text: Vec<&str> = parts.iter().filter_map(|p| str_field(p, "text")).collect();
        Value::String(text.join("\n"))
    } else {
        Value::Null
    };

    if content.is_null() && tool_calls.is_empty() {
        return;
    }

    let mut converted = json!({"role": role, "content": content});
    if !tool_calls.is_empty() {
        converted["tool_calls"] = Value::Array(tool_calls);
    }
    out.push(converted);
}

fn image_url(block: &Value) -> Option<String> {
    let source = block.get("source")?;
    match str_field(source, "type") {
        Some("base64") => Some(format!(
            "data:{};base64,{}",
            str_field(source, "media_type").unwrap_or("image/png"),
            str_field(source, "data")?
        )),
        Some("url") => str_field(source, "url").map(str::to_string),
        _ => None,
    }
}

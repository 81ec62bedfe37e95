//! Into Anthropic Messages shape.

use super::{rename_field, str_field, Transformer};
use crate::error::TransformError;
use crate::provider::WireFormat;
use serde_json::{json, Map, Value};

/// Chat Completions request fields the Messages API rejects.
const DROPPED_REQUEST_FIELDS: &[&str] = &[
    "n",
    "stream_options",
    "logprobs",
    "top_logprobs",
    "presence_penalty",
    "frequency_penalty",
    "seed",
    "response_format",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicTransformer;

impl Transformer for AnthropicTransformer {
    fn target(&self) -> WireFormat {
        WireFormat::Anthropic
    }

    fn transform_request_value(
        &self,
        mut body: Map<String, Value>,
    ) -> Result<Value, TransformError> {
        rename_field(&mut body, "max_completion_tokens", "max_tokens");
        for field in DROPPED_REQUEST_FIELDS {
            body.remove(*field);
        }

        match body.remove("stop") {
            Some(Value::String(stop)) => {
                body.insert("stop_sequences".to_string(), json!([stop]));
            }
            Some(Value::Null) | None => {}
            Some(stops) => {
                body.insert("stop_sequences".to_string(), stops);
            }
        }

        if let Some(Value::Array(tools)) = body.get_mut("tools") {
            for tool in tools.iter_mut() {
                convert_tool(tool);
            }
        }
        if let Some(choice) = body.remove("tool_choice") {
            body.insert("tool_choice".to_string(), convert_tool_choice(choice));
        }

        if let Some(Value::Array(inbound)) = body.remove("messages") {
            let (system, messages) = convert_messages(inbound);
            if !system.is_empty() && !body.contains_key("system") {
                body.insert("system".to_string(), Value::String(system.join("\n")));
            }
            body.insert("messages".to_string(), Value::Array(messages));
        }

        Ok(Value::Object(body))
    }

    fn transform_response_value(
        &self,
        body: Map<String, Value>,
    ) -> Result<Value, TransformError> {
        let choice = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .ok_or(TransformError::MissingField("choices"))?;
        let message = choice.get("message").unwrap_or(&Value::Null);

        let mut content = Vec::new();
        if let Some(text) = str_field(message, "content").filter(|t| !t.is_empty()) {
            content.push(json!({"type": "text", "text": text}));
        }
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            content.extend(calls.iter().map(tool_call_to_block));
        }

        let stop_reason = match choice.get("finish_reason") {
            Some(Value::String(reason)) => Value::String(map_finish_reason(reason).to_string()),
            Some(other) => other.clone(),
            None => Value::Null,
        };

        let mut out = json!({
            "id": body.get("id").cloned().unwrap_or(Value::Null),
            "type": "message",
            "role": "assistant",
            "model": body.get("model").cloned().unwrap_or(Value::Null),
            "content": content,
            "stop_reason": stop_reason,
            "stop_sequence": null,
        });

        if let Some(usage) = body.get("usage") {
            out["usage"] = json!({
                "input_tokens": usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                "output_tokens": usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
            });
        }

        Ok(out)
    }
}

fn map_finish_reason(reason: &str) -> &str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        other => other,
    }
}

/// `{type: function, function: {name, description, parameters}}` -> `{name, description, input_schema}`
fn convert_tool(tool: &mut Value) {
    if str_field(tool, "type") != Some("function") {
        return;
    }
    let Some(function) = tool.get_mut("function").map(Value::take) else {
        return;
    };
    let mut converted = Map::new();
    if let Some(name) = function.get("name") {
        converted.insert("name".to_string(), name.clone());
    }
    if let Some(description) = function.get("description") {
        converted.insert("description".to_string(), description.clone());
    }
    converted.insert(
        "input_schema".to_string(),
        function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    );
    *tool = Value::Object(converted);
}

fn convert_tool_choice(choice: Value) -> Value {
    match &choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => json!({"type": "auto"}),
            "required" => json!({"type": "any"}),
            "none" => json!({"type": "none"}),
            _ => choice,
        },
        Value::Object(_) => match choice.get("function").and_then(|f| f.get("name")) {
            Some(name) => json!({"type": "tool", "name": name}),
            None => choice,
        },
        _ => choice,
    }
}

fn tool_call_to_block(call: &Value) -> Value {
    let function = call.get("function").unwrap_or(&Value::Null);
    let arguments = str_field(function, "arguments").unwrap_or("{}");
    let input: Value =
        serde_json::from_str(arguments).unwrap_or_else(|_| json!({"raw": arguments}));
    json!({
        "type": "tool_use",
        "id": call.get("id").cloned().unwrap_or(Value::Null),
        "name": function.get("name").cloned().unwrap_or(Value::Null),
        "input": input,
    })
}

/// Hoist system messages and fold tool traffic into content blocks.
/// Consecutive `role: tool` messages merge into a single user turn.
fn convert_messages(inbound: Vec<Value>) -> (Vec<String>, Vec<Value>) {
    let mut system = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in inbound {
        match str_field(&message, "role") {
            Some("system") | Some("developer") => {
                if let Some(content) = message.get("content") {
                    system.extend(text_of(content));
                }
            }
            Some("tool") => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
                    "content": text_of(message.get("content").unwrap_or(&Value::Null)).join("\n"),
                });
                match messages.last_mut() {
                    Some(last) if is_tool_result_turn(last) => {
                        if let Some(Value::Array(blocks)) = last.get_mut("content") {
                            blocks.push(block);
                        }
                    }
                    _ => messages.push(json!({"role": "user", "content": [block]})),
                }
            }
            Some("assistant") if message.get("tool_calls").is_some() => {
                let mut blocks = Vec::new();
                if let Some(text) = str_field(&message, "content").filter(|t| !t.is_empty()) {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
                    blocks.extend(calls.iter().map(tool_call_to_block));
                }
                messages.push(json!({"role": "assistant", "content": blocks}));
            }
            _ => messages.push(convert_content_parts(message)),
        }
    }

    (system, messages)
}

fn is_tool_result_turn(message: &Value) -> bool {
    str_field(message, "role") == Some("user")
        && message
            .get("content")
            .and_then(Value::as_array)
            .is_some_and(|blocks| {
                blocks
                    .iter()
                    .all(|b| str_field(b, "type") == Some("tool_result"))
            })
}

/// `image_url` parts become image blocks; everything else is kept.
fn convert_content_parts(mut message: Value) -> Value {
    if let Some(Value::Array(parts)) = message.get_mut("content") {
        for part in parts.iter_mut() {
            if str_field(part, "type") != Some("image_url") {
                continue;
            }
            let url = part
                .get("image_url")
                .and_then(|i| i.get("url"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            *part = image_block(&url);
        }
    }
    message
}

fn image_block(url: &str) -> Value {
    if let Some((meta, data)) = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
    {
        return json!({
            "type": "image",
            "source": {"type": "base64", "media_type": meta, "data": data}
        });
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

fn text_of(content: &Value) -> Vec<String> {
    match content {
        Value::String(text) => vec![text.clone()],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| str_field(p, "text").map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: Value) -> Value {
        AnthropicTransformer
            .transform_request_value(body.as_object().unwrap().clone())
            .unwrap()
    }

    fn response(body: Value) -> Value {
        AnthropicTransformer
            .transform_response_value(body.as_object().unwrap().clone())
            .unwrap()
    }

    #[test]
    fn test_request_field_mapping() {
        let out = request(json!({
            "model": "gpt-4.1",
            "max_completion_tokens": 2048,
            "n": 1,
            "stop": "###",
            "stream": true,
            "stream_options": {"include_usage": true},
            "logprobs": false,
            "top_logprobs": 0,
            "presence_penalty": 0.1,
            "frequency_penalty": 0.1,
            "seed": 7,
            "response_format": {"type": "text"},
            "messages": [{"role": "user", "content": "hi"}]
        }));

        assert_eq!(
            out,
            json!({
                "model": "gpt-4.1",
                "max_tokens": 2048,
                "stop_sequences": ["###"],
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })
        );
    }

    #[test]
    fn test_stop_list_and_null() {
        let out = request(json!({"stop": ["a", "b"], "messages": []}));
        assert_eq!(out["stop_sequences"], json!(["a", "b"]));

        let out = request(json!({"stop": null, "messages": []}));
        assert!(out.get("stop_sequences").is_none());
    }

    #[test]
    fn test_tools_and_choice() {
        let out = request(json!({
            "tools": [{
                "type": "function",
                "function": {
                    "name": "grep",
                    "description": "Search files",
                    "parameters": {"type": "object", "properties": {"q": {"type": "string"}}}
                }
            }],
            "tool_choice": "required",
            "messages": []
        }));

        assert_eq!(
            out["tools"][0],
            json!({
                "name": "grep",
                "description": "Search files",
                "input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}
            })
        );
        assert_eq!(out["tool_choice"], json!({"type": "any"}));

        let named = request(json!({
            "tool_choice": {"type": "function", "function": {"name": "grep"}},
            "messages": []
        }));
        assert_eq!(named["tool_choice"], json!({"type": "tool", "name": "grep"}));
    }

    #[test]
    fn test_system_messages_are_hoisted() {
        let out = request(json!({
            "messages": [
                {"role": "system", "content": "rule one"},
                {"role": "system", "content": [{"type": "text", "text": "rule two"}]},
                {"role": "user", "content": "go"}
            ]
        }));
        assert_eq!(out["system"], "rule one\nrule two");
        assert_eq!(out["messages"], json!([{"role": "user", "content": "go"}]));
    }

    #[test]
    fn test_tool_calls_and_results() {
        let out = request(json!({
            "messages": [
                {"role": "user", "content": "list files"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "ls", "arguments": "{\"dir\":\"src\"}"}},
                    {"id": "call_2", "type": "function", "function": {"name": "ls", "arguments": "{\"dir\":\"tests\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "main.rs"},
                {"role": "tool", "tool_call_id": "call_2", "content": "e2e.rs"}
            ]
        }));

        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[1]["content"][1],
            json!({"type": "tool_use", "id": "call_2", "name": "ls", "input": {"dir": "tests"}})
        );
        assert_eq!(
            messages[2],
            json!({"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "call_1", "content": "main.rs"},
                {"type": "tool_result", "tool_use_id": "call_2", "content": "e2e.rs"}
            ]})
        );
    }

    #[test]
    fn test_image_url_parts() {
        let out = request(json!({
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBOR"}},
                {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
            ]}]
        }));
        let content = &out["messages"][0]["content"];
        assert_eq!(
            content[1],
            json!({"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "iVBOR"}})
        );
        assert_eq!(content[2]["source"]["url"], "https://example.com/cat.png");
    }

    #[test]
    fn test_response_mapping() {
        let out = response(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4.1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Done."},
                "finish_reason": "length"
            }],
            "usage": {"prompt_tokens": 30, "completion_tokens": 4, "total_tokens": 34}
        }));

        assert_eq!(
            out,
            json!({
                "id": "chatcmpl-1",
                "type": "message",
                "role": "assistant",
                "model": "gpt-4.1",
                "content": [{"type": "text", "text": "Done."}],
                "stop_reason": "max_tokens",
                "stop_sequence": null,
                "usage": {"input_tokens": 30, "output_tokens": 4}
            })
        );
    }

    #[test]
    fn test_response_finish_reasons() {
        for (openai, anthropic) in [
            ("stop", "end_turn"),
            ("length", "max_tokens"),
            ("tool_calls", "tool_use"),
            ("content_filter", "content_filter"),
        ] {
            let out = response(json!({
                "choices": [{"message": {"content": "x"}, "finish_reason": openai}]
            }));
            assert_eq!(out["stop_reason"], anthropic);
        }
    }

    #[test]
    fn test_response_tool_calls() {
        let out = response(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "do", "arguments": "{\"x\":1}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }));
        assert_eq!(out["stop_reason"], "tool_use");
        assert_eq!(
            out["content"],
            json!([{"type": "tool_use", "id": "call_1", "name": "do", "input": {"x": 1}}])
        );
    }

    #[test]
    fn test_error_body_is_rejected() {
        let err = AnthropicTransformer
            .transform_response_value(
                json!({"error": {"message": "bad key"}})
                    .as_object()
                    .unwrap()
                    .clone(),
            )
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingField("choices")));
    }
}

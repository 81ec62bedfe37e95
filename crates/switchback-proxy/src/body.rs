//! Best-effort view over an inbound request body.
//!
//! Routing decisions must never fail a request, so the body is decoded once
//! into an optional JSON value and every accessor is total over "absent".

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct RequestBody {
    decoded: Option<Value>,
}

impl RequestBody {
    pub fn decode(raw: &[u8]) -> Self {
        Self {
            decoded: serde_json::from_slice(raw).ok(),
        }
    }

    pub fn from_value(value: Value) -> Self {
        Self {
            decoded: Some(value),
        }
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.is_some()
    }

    /// The requested model, empty when absent.
    pub fn model(&self) -> &str {
        self.decoded
            .as_ref()
            .and_then(|v| v.get("model"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// `thinking: {"type": "enabled", ...}`
    pub fn thinking_enabled(&self) -> bool {
        self.decoded
            .as_ref()
            .and_then(|v| v.get("thinking"))
            .and_then(|t| t.get("type"))
            .and_then(Value::as_str)
            == Some("enabled")
    }

    pub fn messages(&self) -> &[Value] {
        self.decoded
            .as_ref()
            .and_then(|v| v.get("messages"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn system(&self) -> Option<&Value> {
        self.decoded.as_ref().and_then(|v| v.get("system"))
    }

    /// Session id carried in `metadata.user_id`. Claude Code encodes it as
    /// `user_<hash>_account_<uuid>_session_<uuid>`; only the session part is kept.
    pub fn session_id(&self) -> Option<String> {
        let user_id = self
            .decoded
            .as_ref()?
            .get("metadata")?
            .get("user_id")?
            .as_str()?;
        if user_id.is_empty() {
            return None;
        }
        let session = match user_id.rfind("_session_") {
            Some(idx) => &user_id[idx + "_session_".len()..],
            None => user_id,
        };
        (!session.is_empty()).then(|| session.to_string())
    }

    /// Serialize a copy of the body with `model` replaced. `None` when the body
    /// is not a JSON object.
    pub fn with_model(&self, model: &str) -> Option<Vec<u8>> {
        let mut value = self.decoded.clone()?;
        value
            .as_object_mut()?
            .insert("model".to_string(), Value::String(model.to_string()));
        serde_json::to_vec(&value).ok()
    }
}

/// Text of every `type == "text"` block in a content value, or the string
/// itself when content is a plain string.
pub(crate) fn text_segments(content: &Value) -> Box<dyn Iterator<Item = &str> + '_> {
    match content {
        Value::String(text) => Box::new(std::iter::once(text.as_str())),
        Value::Array(blocks) => Box::new(blocks.iter().filter_map(|block| {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                block.get("text").and_then(Value::as_str)
            } else {
                None
            }
        })),
        _ => Box::new(std::iter::empty()),
    }
}

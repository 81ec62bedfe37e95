//! Anthropic <-> OpenAI body translation.
//!
//! Each codec converts bodies *into* its own wire format:
//! - [`AnthropicTransformer`] turns OpenAI Chat Completions requests and
//!   responses into Anthropic Messages shape.
//! - [`OpenAiTransformer`] does the reverse.
//!
//! Requests are converted into the provider's format; responses into the
//! client's. Both are fail-open at the call site: an `Err` means "relay the
//! original bytes".

mod anthropic;
mod openai;

pub use anthropic::AnthropicTransformer;
pub use openai::OpenAiTransformer;

use crate::error::TransformError;
use crate::provider::WireFormat;
use bytes::Bytes;
use serde_json::{Map, Value};

pub trait Transformer: Send + Sync {
    /// Format this codec produces.
    fn target(&self) -> WireFormat;

    fn transform_request_value(&self, body: Map<String, Value>)
        -> Result<Value, TransformError>;

    fn transform_response_value(
        &self,
        body: Map<String, Value>,
    ) -> Result<Value, TransformError>;

    fn transform_request(&self, body: &[u8]) -> Result<Bytes, TransformError> {
        let value = self.transform_request_value(parse_object(body)?)?;
        Ok(Bytes::from(serde_json::to_vec(&value)?))
    }

    fn transform_response(&self, body: &[u8]) -> Result<Bytes, TransformError> {
        let value = self.transform_response_value(parse_object(body)?)?;
        Ok(Bytes::from(serde_json::to_vec(&value)?))
    }
}

/// True when client and provider speak different formats.
pub fn needs_transform(client: WireFormat, provider: WireFormat) -> bool {
    client != provider
}

/// Codec producing `target`.
pub fn transformer_for(target: WireFormat) -> &'static dyn Transformer {
    match target {
        WireFormat::Anthropic => &AnthropicTransformer,
        WireFormat::OpenAi => &OpenAiTransformer,
    }
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>, TransformError> {
    match serde_json::from_slice(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(TransformError::NotAnObject),
    }
}

/// Rename `from` to `to` when present. An existing `to` is kept.
fn rename_field(body: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = body.remove(from) {
        body.entry(to.to_string()).or_insert(value);
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

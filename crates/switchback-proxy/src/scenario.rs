//! Request scenario detection.

use crate::body::{text_segments, RequestBody};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub use switchback_config::DEFAULT_LONG_CONTEXT_THRESHOLD;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scenario {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "think")]
    Think,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "longContext")]
    LongContext,
}

impl Scenario {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Think => "think",
            Self::Image => "image",
            Self::LongContext => "longContext",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "think" => Ok(Self::Think),
            "image" => Ok(Self::Image),
            "longContext" | "long_context" => Ok(Self::LongContext),
            other => Err(format!("unknown scenario: {}", other)),
        }
    }
}

/// Classify a request. First match wins: think, image, long context, default.
pub fn detect_scenario(body: &RequestBody, long_context_threshold: usize) -> Scenario {
    if body.thinking_enabled() {
        return Scenario::Think;
    }
    if has_image_block(body.messages()) {
        return Scenario::Image;
    }
    if reaches_threshold(body, long_context_threshold) {
        return Scenario::LongContext;
    }
    Scenario::Default
}

fn has_image_block(messages: &[Value]) -> bool {
    messages.iter().any(|message| {
        message
            .get("content")
            .and_then(Value::as_array)
            .is_some_and(|blocks| {
                blocks
                    .iter()
                    .any(|b| b.get("type").and_then(Value::as_str) == Some("image"))
            })
    })
}

fn reaches_threshold(body: &RequestBody, threshold: usize) -> bool {
    let message_text = body
        .messages()
        .iter()
        .filter_map(|message| message.get("content"))
        .flat_map(text_segments);
    let system_text = body.system().into_iter().flat_map(text_segments);

    let mut total = 0usize;
    for text in message_text.chain(system_text) {
        total += text.chars().count();
        if total >= threshold {
            return true;
        }
    }
    false
}

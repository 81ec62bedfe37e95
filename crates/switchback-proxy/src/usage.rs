//! Per-session token usage.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub trait UsageSink: Send + Sync {
    fn report(&self, record: UsageRecord);
}

/// Token counts from a response body's `usage` object. Accepts the Anthropic
/// (`input_tokens`/`output_tokens`) or OpenAI (`prompt_tokens`/`completion_tokens`)
/// naming. `None` when the body carries no usage.
pub fn extract_usage(body: &[u8]) -> Option<(u64, u64)> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    let count = |primary: &str, alternate: &str| {
        usage
            .get(primary)
            .or_else(|| usage.get(alternate))
            .and_then(Value::as_u64)
    };
    let input = count("input_tokens", "prompt_tokens");
    let output = count("output_tokens", "completion_tokens");
    if input.is_none() && output.is_none() {
        return None;
    }
    Some((input.unwrap_or(0), output.unwrap_or(0)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionUsage {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// In-process sink keeping cumulative totals per session.
#[derive(Debug, Default)]
pub struct UsageTracker {
    sessions: Mutex<HashMap<String, SessionUsage>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionUsage> {
        self.sessions.lock().get(session_id).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, SessionUsage> {
        self.sessions.lock().clone()
    }
}

impl UsageSink for UsageTracker {
    fn report(&self, record: UsageRecord) {
        let mut sessions = self.sessions.lock();
        let totals = sessions.entry(record.session_id).or_default();
        totals.requests += 1;
        totals.input_tokens += record.input_tokens;
        totals.output_tokens += record.output_tokens;
    }
}

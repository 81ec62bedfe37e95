//! Upstream outcome classification.
//!
//! Decides, from a status code and (for server errors) the response body,
//! whether the chain walk stops here or fails over to the next provider, and
//! what the current provider's health should become.

use serde_json::Value;

/// Substrings that mark a 5xx as the request's fault rather than the
/// provider's. Matched against the lowercased error message.
const REQUEST_RELATED_KEYWORDS: &[&str] = &[
    "context",
    "token",
    "too long",
    "too large",
    "exceeds",
    "maximum",
    "limit",
    "length",
    "size",
    "prompt",
];

/// Health consequence of an attempt that did not end the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Penalty {
    /// `mark_failed`
    Transient,
    /// `mark_auth_failed`
    Auth,
    /// Leave health untouched
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 401, 402, 403
    AuthFailure,
    /// 429
    RateLimited,
    /// >= 500; needs the body to tell provider faults from request faults
    ServerError,
    /// Everything else, relayed as-is
    Terminal,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            401..=403 => Self::AuthFailure,
            429 => Self::RateLimited,
            s if s >= 500 => Self::ServerError,
            _ => Self::Terminal,
        }
    }

    /// Penalty for this class. Server errors default to transient; callers
    /// should consult [`is_request_related`] first.
    pub fn penalty(self) -> Penalty {
        match self {
            Self::AuthFailure => Penalty::Auth,
            Self::RateLimited | Self::ServerError => Penalty::Transient,
            Self::Terminal => Penalty::None,
        }
    }
}

/// True when a server-error body blames the request itself (oversized prompt,
/// invalid parameters). Such failures move on without penalising the provider.
pub fn is_request_related(body: &[u8]) -> bool {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let error_type = error
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .or_else(|| parsed.as_ref()?.get("type")?.as_str());
    if error_type == Some("invalid_request_error") {
        return true;
    }

    let message = match error_message(parsed.as_ref()) {
        Some(message) => message.to_lowercase(),
        None => String::from_utf8_lossy(body).to_lowercase(),
    };
    REQUEST_RELATED_KEYWORDS
        .iter()
        .any(|keyword| message.contains(keyword))
}

/// `error.message`, `error` as a string, or a top-level `message`.
fn error_message(parsed: Option<&Value>) -> Option<&str> {
    let parsed = parsed?;
    match parsed.get("error") {
        Some(Value::String(message)) => Some(message),
        Some(error) => error.get("message").and_then(Value::as_str),
        None => parsed.get("message").and_then(Value::as_str),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert_eq!(StatusClass::of(401), StatusClass::AuthFailure);
        assert_eq!(StatusClass::of(402), StatusClass::AuthFailure);
        assert_eq!(StatusClass::of(403), StatusClass::AuthFailure);
        assert_eq!(StatusClass::of(429), StatusClass::RateLimited);
        assert_eq!(StatusClass::of(500), StatusClass::ServerError);
        assert_eq!(StatusClass::of(529), StatusClass::ServerError);
        assert_eq!(StatusClass::of(200), StatusClass::Terminal);
        assert_eq!(StatusClass::of(400), StatusClass::Terminal);
        assert_eq!(StatusClass::of(404), StatusClass::Terminal);
        assert_eq!(StatusClass::of(413), StatusClass::Terminal);
    }

    #[test]
    fn test_penalties() {
        assert_eq!(StatusClass::AuthFailure.penalty(), Penalty::Auth);
        assert_eq!(StatusClass::RateLimited.penalty(), Penalty::Transient);
        assert_eq!(StatusClass::ServerError.penalty(), Penalty::Transient);
        assert_eq!(StatusClass::Terminal.penalty(), Penalty::None);
    }

    #[test]
    fn test_invalid_request_error_type() {
        let body = br#"{"type":"error","error":{"type":"invalid_request_error","message":"nope"}}"#;
        assert!(is_request_related(body));
    }

    #[test]
    fn test_keyword_in_message() {
        let body = br#"{"error":{"type":"api_error","message":"Prompt is too long: 210000 tokens"}}"#;
        assert!(is_request_related(body));

        let body = br#"{"error":"Maximum context exceeded"}"#;
        assert!(is_request_related(body));
    }

    #[test]
    fn test_provider_fault() {
        let body = br#"{"error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert!(!is_request_related(body));
        assert!(!is_request_related(b""));
    }

    #[test]
    fn test_non_json_body_is_searched_whole() {
        assert!(is_request_related(b"upstream says: request SIZE too big"));
        assert!(!is_request_related(b"502 Bad Gateway"));
    }
}

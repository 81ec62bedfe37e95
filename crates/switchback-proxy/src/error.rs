//! Proxy error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown wire format {0:?} (expected anthropic or openai)")]
    UnknownWireFormat(String),

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("log sink error: {0}")]
    LogSink(#[source] std::io::Error),
}

/// Why a body could not be translated. Never surfaced to the caller; the
/// orchestrator relays the original bytes instead.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("body is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("body is not a JSON object")]
    NotAnObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

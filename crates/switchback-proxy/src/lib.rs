//! Switchback - local failover proxy for Claude Code and Codex.
//!
//! The CLI talks to a loopback listener as if it were its usual API. Each
//! request is matched to a scenario (thinking, image, long context), resolved
//! to an ordered provider chain and walked until one provider answers:
//! - Unhealthy providers are skipped until their backoff expires, except the
//!   last one in the chain, which is always tried.
//! - Auth, rate-limit and server failures fail over and back the provider off.
//! - Bodies are translated between Anthropic Messages and OpenAI Chat
//!   Completions when client and provider disagree.

pub mod body;
pub mod classify;
pub mod error;
pub mod log;
pub mod model_map;
pub mod provider;
pub mod proxy;
pub mod routing;
pub mod scenario;
pub mod server;
pub mod telemetry;
pub mod transform;
pub mod usage;

pub use body::RequestBody;
pub use error::{ProxyError, TransformError};
pub use log::{JsonlLogSink, LogLevel, MemoryLogSink, ProxyLogRecord, ProxyLogSink, TracingLogSink};
pub use provider::{HealthSnapshot, Provider, WireFormat};
pub use proxy::{FailureRecord, Proxy, ProxyOptions, ProxyOutcome, ProxyRequest, RelayedResponse, ResponseBody};
pub use routing::{ProviderRegistry, ResolvedChain, RoutingTable, ScenarioRoute};
pub use scenario::{detect_scenario, Scenario};
pub use server::{bind, router, BoundServer};
pub use usage::{UsageRecord, UsageSink, UsageTracker};

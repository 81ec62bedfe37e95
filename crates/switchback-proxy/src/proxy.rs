//! Failover orchestration: walk the resolved chain until one provider gives an
//! answer worth relaying.

use crate::body::RequestBody;
use crate::classify::{is_request_related, Penalty, StatusClass};
use crate::error::ProxyError;
use crate::log::{LogLevel, ProxyLogRecord, ProxyLogSink, TracingLogSink};
use crate::model_map::select_model;
use crate::provider::{Provider, WireFormat};
use crate::routing::{ProviderRegistry, RoutingTable};
use crate::transform::{needs_transform, transformer_for};
use crate::usage::{extract_usage, UsageRecord, UsageSink};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use switchback_config::SwitchbackConfig;
use tracing::debug;

/// Upstream request timeout unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Format the calling CLI speaks
    pub client_format: WireFormat,
    /// Calling CLI name, selects provider env overlays
    pub cli: String,
    pub request_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            client_format: WireFormat::Anthropic,
            cli: "claude".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Inbound request, fully buffered.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = (!query.is_empty()).then_some(query);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

pub enum ResponseBody {
    Buffered(Bytes),
    /// Server-sent events, relayed chunk by chunk without transformation
    Stream(BoxStream<'static, Result<Bytes, reqwest::Error>>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// A provider's answer, ready to hand back to the caller.
#[derive(Debug)]
pub struct RelayedResponse {
    pub provider: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

/// Why one provider was passed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub error: String,
    /// Start of the provider's response body, if it sent one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

#[derive(Debug)]
pub enum ProxyOutcome {
    Relayed(RelayedResponse),
    /// Every provider in the chain failed
    Exhausted(Vec<FailureRecord>),
}

impl ProxyOutcome {
    /// Status returned when the chain is exhausted.
    pub const EXHAUSTED_STATUS: StatusCode = StatusCode::BAD_GATEWAY;

    /// JSON body for an exhausted chain.
    pub fn exhausted_body(failures: &[FailureRecord]) -> Bytes {
        let body = json!({
            "type": "error",
            "error": {
                "type": "all_providers_failed",
                "message": format!("all {} provider attempts failed", failures.len()),
            },
            "failures": failures,
        });
        Bytes::from(body.to_string())
    }
}

/// Result of a single attempt that did not end the walk.
enum Attempt {
    Relay(RelayedResponse),
    Failover(FailureRecord),
}

pub struct Proxy {
    routing: Arc<RoutingTable>,
    client: reqwest::Client,
    client_format: WireFormat,
    cli: String,
    log: Arc<dyn ProxyLogSink>,
    usage: Option<Arc<dyn UsageSink>>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("routing", &self.routing)
            .field("client_format", &self.client_format)
            .field("cli", &self.cli)
            .finish_non_exhaustive()
    }
}

impl Proxy {
    pub fn new(routing: RoutingTable, options: ProxyOptions) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self {
            routing: Arc::new(routing),
            client,
            client_format: options.client_format,
            cli: options.cli,
            log: Arc::new(TracingLogSink),
            usage: None,
        })
    }

    /// Build from resolved configuration. `profile` overrides `active_profile`.
    pub fn from_config(config: &SwitchbackConfig, profile: Option<&str>) -> Result<Self, ProxyError> {
        let profile_name = profile.unwrap_or(&config.active_profile);
        let profile = config
            .profile(profile_name)
            .ok_or_else(|| ProxyError::UnknownProfile(profile_name.to_string()))?;

        let registry = ProviderRegistry::from_config(config);
        let routing = RoutingTable::from_profile(profile, &registry)?;
        if routing.default_providers().is_empty() {
            return Err(ProxyError::Configuration(format!(
                "profile {} has no providers",
                profile_name
            )));
        }

        let options = ProxyOptions {
            client_format: config.proxy.effective_client_format().parse()?,
            cli: config.proxy.client.clone(),
            request_timeout: Duration::from_secs(config.proxy.request_timeout_secs),
        };
        let mut proxy = Self::new(routing, options)?;
        if let Some(path) = &config.proxy.log_file {
            proxy = proxy.with_log_sink(Arc::new(crate::log::JsonlLogSink::open(path)?));
        }
        Ok(proxy)
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn ProxyLogSink>) -> Self {
        self.log = sink;
        self
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(sink);
        self
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn client_format(&self) -> WireFormat {
        self.client_format
    }

    /// Walk the chain for `request`.
    ///
    /// Dropping the returned future cancels the in-flight upstream call; no
    /// health is recorded and no further provider is tried. The HTTP listener
    /// drops it when the caller disconnects.
    pub async fn forward(&self, request: ProxyRequest) -> ProxyOutcome {
        let body = RequestBody::decode(&request.body);
        let scenario = self.routing.detect(&body);
        let chain = self.routing.resolve(scenario);
        let session_id = body.session_id();
        debug!(
            scenario = %scenario,
            chain_len = chain.len(),
            session = session_id.as_deref().unwrap_or_default(),
            "resolved provider chain"
        );

        let mut failures = Vec::new();
        let last = chain.len().saturating_sub(1);

        for (index, provider) in chain.providers.iter().enumerate() {
            let is_last = index == last;
            if !provider.poll_and_maybe_recover() {
                if !is_last {
                    self.record(&request, provider, LogLevel::Info, "skipping unhealthy provider");
                    continue;
                }
                self.record(
                    &request,
                    provider,
                    LogLevel::Warn,
                    "last provider is unhealthy, trying anyway",
                );
            }

            let model = select_model(provider, &body, chain.model_override(provider.name()));
            match self
                .attempt(&request, &body, provider, &model, session_id.as_deref())
                .await
            {
                Attempt::Relay(response) => return ProxyOutcome::Relayed(response),
                Attempt::Failover(failure) => failures.push(failure),
            }
        }

        let mut record = ProxyLogRecord::new(
            LogLevel::Error,
            "",
            request.method.as_str(),
            &request.path,
            format!("all providers failed ({} attempts)", failures.len()),
        )
        .with_status(ProxyOutcome::EXHAUSTED_STATUS.as_u16());
        if let Some(last_failure) = failures.last() {
            record = record.with_error(last_failure.error.clone());
        }
        self.log.record(record);

        ProxyOutcome::Exhausted(failures)
    }

    async fn attempt(
        &self,
        request: &ProxyRequest,
        body: &RequestBody,
        provider: &Provider,
        model: &str,
        session_id: Option<&str>,
    ) -> Attempt {
        let outbound = self.outbound_body(request, body, provider, model);
        let url = join_url(provider.base_url(), &request.path, request.query.as_deref());
        let headers = self.outbound_headers(&request.headers, provider);

        self.log.record(
            ProxyLogRecord::new(
                LogLevel::Debug,
                provider.name(),
                request.method.as_str(),
                &request.path,
                format!("forwarding to {} with model {}", url, model),
            ),
        );

        let response = match self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(outbound)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                provider.mark_failed();
                return self.failover(request, provider, None, err.to_string(), b"", LogLevel::Warn);
            }
        };

        let status = response.status();
        match StatusClass::of(status.as_u16()) {
            class @ (StatusClass::AuthFailure | StatusClass::RateLimited) => {
                let body = response.bytes().await.unwrap_or_default();
                apply_penalty(provider, class.penalty());
                let reason = match class {
                    StatusClass::AuthFailure => "authentication or billing failure",
                    _ => "rate limited",
                };
                self.failover(request, provider, Some(status), reason.to_string(), &body, LogLevel::Warn)
            }
            class @ StatusClass::ServerError => {
                let body = response.bytes().await.unwrap_or_default();
                if is_request_related(&body) {
                    return self.failover(
                        request,
                        provider,
                        Some(status),
                        "request-related server error".to_string(),
                        &body,
                        LogLevel::Info,
                    );
                }
                apply_penalty(provider, class.penalty());
                self.failover(request, provider, Some(status), "server error".to_string(), &body, LogLevel::Warn)
            }
            StatusClass::Terminal => {
                self.relay(request, provider, model, session_id, response)
                    .await
            }
        }
    }

    /// Body to send: model rewritten when it changed, then translated into the
    /// provider's format. Either step falls back to the previous bytes.
    fn outbound_body(
        &self,
        request: &ProxyRequest,
        body: &RequestBody,
        provider: &Provider,
        model: &str,
    ) -> Bytes {
        let mut outbound = request.body.clone();
        if model != body.model() {
            if let Some(rewritten) = body.with_model(model) {
                outbound = Bytes::from(rewritten);
            }
        }

        if request.body.is_empty() || !needs_transform(self.client_format, provider.format()) {
            return outbound;
        }

        let codec = transformer_for(provider.format());
        match codec.transform_request(&outbound) {
            Ok(transformed) => {
                self.record(
                    request,
                    provider,
                    LogLevel::Debug,
                    &format!("translated request {} -> {}", self.client_format, codec.target()),
                );
                transformed
            }
            Err(err) => {
                self.log.record(
                    ProxyLogRecord::new(
                        LogLevel::Warn,
                        provider.name(),
                        request.method.as_str(),
                        &request.path,
                        "request translation failed, sending original body",
                    )
                    .with_error(err.to_string()),
                );
                outbound
            }
        }
    }

    fn outbound_headers(&self, inbound: &HeaderMap, provider: &Provider) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(inbound.len() + 4);
        for (name, value) in inbound {
            if is_forwardable(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }

        let token = provider.token();
        if !token.is_empty() {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert("x-api-key", value);
            }
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        for (key, value) in provider.env_overlay(&self.cli) {
            let name = format!("x-env-{}", key.to_ascii_lowercase().replace('_', "-"));
            match (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!(provider = provider.name(), key, "skipping env overlay entry that is not a valid header"),
            }
        }

        headers
    }

    async fn relay(
        &self,
        request: &ProxyRequest,
        provider: &Provider,
        model: &str,
        session_id: Option<&str>,
        response: reqwest::Response,
    ) -> Attempt {
        let status = response.status();
        let headers = relay_headers(response.headers());
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_event_stream {
            provider.mark_healthy();
            self.record_status(request, provider, LogLevel::Info, status, "streaming response");
            let stream = response
                .bytes_stream()
                .filter(|chunk| futures::future::ready(!matches!(chunk, Ok(bytes) if bytes.is_empty())))
                .boxed();
            return Attempt::Relay(RelayedResponse {
                provider: provider.name().to_string(),
                status,
                headers,
                body: ResponseBody::Stream(stream),
            });
        }

        let raw = match response.bytes().await {
            Ok(raw) => raw,
            Err(err) => {
                provider.mark_failed();
                return self.failover(
                    request,
                    provider,
                    Some(status),
                    format!("failed to read response body: {}", err),
                    b"",
                    LogLevel::Warn,
                );
            }
        };
        provider.mark_healthy();

        if let (Some(session_id), Some(usage)) = (session_id, &self.usage) {
            if let Some((input_tokens, output_tokens)) = extract_usage(&raw) {
                usage.report(UsageRecord {
                    session_id: session_id.to_string(),
                    provider: provider.name().to_string(),
                    model: model.to_string(),
                    input_tokens,
                    output_tokens,
                });
            }
        }

        let body = if needs_transform(self.client_format, provider.format()) && !raw.is_empty() {
            match transformer_for(self.client_format).transform_response(&raw) {
                Ok(transformed) => transformed,
                Err(err) => {
                    self.log.record(
                        ProxyLogRecord::new(
                            LogLevel::Debug,
                            provider.name(),
                            request.method.as_str(),
                            &request.path,
                            "response translation failed, relaying original body",
                        )
                        .with_status(status.as_u16())
                        .with_error(err.to_string()),
                    );
                    raw
                }
            }
        } else {
            raw
        };

        self.record_status(request, provider, LogLevel::Info, status, "relaying response");
        Attempt::Relay(RelayedResponse {
            provider: provider.name().to_string(),
            status,
            headers,
            body: ResponseBody::Buffered(body),
        })
    }

    fn failover(
        &self,
        request: &ProxyRequest,
        provider: &Provider,
        status: Option<StatusCode>,
        reason: String,
        body: &[u8],
        level: LogLevel,
    ) -> Attempt {
        let mut record = ProxyLogRecord::new(
            level,
            provider.name(),
            request.method.as_str(),
            &request.path,
            format!("{}, failing over", reason),
        )
        .with_error(reason.clone())
        .with_snippet(body);
        if let Some(status) = status {
            record = record.with_status(status.as_u16());
        }
        self.log.record(record);

        Attempt::Failover(FailureRecord {
            provider: provider.name().to_string(),
            status: status.map(|s| s.as_u16()),
            error: reason,
            response: crate::log::excerpt(body),
        })
    }

    fn record(&self, request: &ProxyRequest, provider: &Provider, level: LogLevel, message: &str) {
        self.log.record(ProxyLogRecord::new(
            level,
            provider.name(),
            request.method.as_str(),
            &request.path,
            message,
        ));
    }

    fn record_status(
        &self,
        request: &ProxyRequest,
        provider: &Provider,
        level: LogLevel,
        status: StatusCode,
        message: &str,
    ) {
        self.log.record(
            ProxyLogRecord::new(level, provider.name(), request.method.as_str(), &request.path, message)
                .with_status(status.as_u16()),
        );
    }
}

fn apply_penalty(provider: &Provider, penalty: Penalty) {
    match penalty {
        Penalty::Transient => provider.mark_failed(),
        Penalty::Auth => provider.mark_auth_failed(),
        Penalty::None => {}
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Inbound header names copied upstream. Host, length and hop-by-hop headers
/// are recomputed by the client.
fn is_forwardable(name: &str) -> bool {
    name != "host" && name != CONTENT_LENGTH.as_str() && !is_hop_by_hop(name)
}

fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    upstream
        .iter()
        .filter(|(name, _)| *name != CONTENT_LENGTH && !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// `base` + `path` with exactly one `/` between them, plus `?query`.
pub fn join_url(base: &str, path: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    let mut url = if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    };
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

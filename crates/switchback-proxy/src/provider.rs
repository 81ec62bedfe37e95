//! Upstream providers and their health/backoff state.
//!
//! A provider is healthy until a failure is recorded. After that it stays
//! unhealthy until its backoff has elapsed; recovery happens lazily the next
//! time someone polls it, there is no background timer.

use crate::error::ProxyError;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use switchback_config::{ModelClassesConfig, ProviderConfig};

/// First backoff after a transient failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(60);
/// Ceiling for transient backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
/// First backoff after an auth/billing failure.
pub const AUTH_INITIAL_BACKOFF: Duration = Duration::from_secs(30 * 60);
/// Ceiling for auth/billing backoff.
pub const AUTH_MAX_BACKOFF: Duration = Duration::from_secs(2 * 60 * 60);

/// JSON shape spoken by a client or provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Anthropic Messages API
    #[default]
    Anthropic,
    /// OpenAI Chat Completions API
    #[serde(rename = "openai")]
    OpenAi,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

impl FromStr for WireFormat {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            _ => Err(ProxyError::UnknownWireFormat(s.to_string())),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct HealthState {
    healthy: bool,
    auth_failed: bool,
    failed_at: Option<Instant>,
    backoff: Duration,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: true,
            auth_failed: false,
            failed_at: None,
            backoff: Duration::ZERO,
        }
    }
}

/// Point-in-time copy of a provider's health fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub auth_failed: bool,
    pub failed_at: Option<Instant>,
    pub backoff: Duration,
}

/// One upstream backend.
///
/// Everything except the health block is fixed at construction, so reading
/// names, tokens and model classes needs no locking.
pub struct Provider {
    name: String,
    format: WireFormat,
    base_url: String,
    token: SecretString,
    models: ModelClassesConfig,
    env: HashMap<String, BTreeMap<String, String>>,
    health: Mutex<HealthState>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

impl Provider {
    pub fn new(
        name: impl Into<String>,
        format: WireFormat,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            format,
            base_url: base_url.into(),
            token: SecretString::from(token.into()),
            models: ModelClassesConfig::default(),
            env: HashMap::new(),
            health: Mutex::new(HealthState::default()),
        }
    }

    pub fn with_models(mut self, models: ModelClassesConfig) -> Self {
        self.models = models;
        self
    }

    /// Add an environment overlay used when proxying for `cli`.
    pub fn with_env(
        mut self,
        cli: impl Into<String>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.env.entry(cli.into()).or_default().extend(vars);
        self
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProxyError> {
        let format = config.format.parse()?;
        let mut provider = Self::new(&config.name, format, &config.base_url, &config.token)
            .with_models(config.models.clone());
        provider.env = config.env.clone();
        Ok(provider)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    pub fn models(&self) -> &ModelClassesConfig {
        &self.models
    }

    /// Non-empty overlay entries for the given calling CLI, sorted by key.
    pub fn env_overlay<'a>(&'a self, cli: &str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.env
            .get(cli)
            .into_iter()
            .flat_map(|vars| vars.iter())
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn health(&self) -> HealthSnapshot {
        let state = self.health.lock();
        HealthSnapshot {
            healthy: state.healthy,
            auth_failed: state.auth_failed,
            failed_at: state.failed_at,
            backoff: state.backoff,
        }
    }

    /// Returns whether the provider may be used, flipping it back to healthy
    /// when its backoff window has passed. This writes state.
    pub fn poll_and_maybe_recover(&self) -> bool {
        self.poll_and_maybe_recover_at(Instant::now())
    }

    pub(crate) fn poll_and_maybe_recover_at(&self, now: Instant) -> bool {
        let mut state = self.health.lock();
        if state.healthy {
            return true;
        }
        let elapsed = state
            .failed_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if elapsed >= state.backoff {
            state.healthy = true;
            return true;
        }
        false
    }

    /// Record a transient failure (transport error, 429, server error).
    pub fn mark_failed(&self) {
        self.mark_failed_at(Instant::now());
    }

    pub(crate) fn mark_failed_at(&self, now: Instant) {
        let mut state = self.health.lock();
        state.healthy = false;
        state.failed_at = Some(now);
        state.backoff = if state.backoff.is_zero() {
            INITIAL_BACKOFF
        } else {
            (state.backoff * 2).min(MAX_BACKOFF)
        };
    }

    /// Record an auth or billing failure (401/402/403).
    pub fn mark_auth_failed(&self) {
        self.mark_auth_failed_at(Instant::now());
    }

    pub(crate) fn mark_auth_failed_at(&self, now: Instant) {
        let mut state = self.health.lock();
        state.healthy = false;
        state.auth_failed = true;
        state.failed_at = Some(now);
        state.backoff = if state.backoff < AUTH_INITIAL_BACKOFF {
            AUTH_INITIAL_BACKOFF
        } else {
            (state.backoff * 2).min(AUTH_MAX_BACKOFF)
        };
    }

    pub fn mark_healthy(&self) {
        let mut state = self.health.lock();
        state.healthy = true;
        state.auth_failed = false;
        state.backoff = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Provider {
        Provider::new("p1", WireFormat::Anthropic, "https://example.com", "sk-test")
    }

    #[test]
    fn test_wire_format_parsing() {
        assert_eq!("".parse::<WireFormat>().unwrap(), WireFormat::Anthropic);
        assert_eq!(
            "anthropic".parse::<WireFormat>().unwrap(),
            WireFormat::Anthropic
        );
        assert_eq!("OpenAI".parse::<WireFormat>().unwrap(), WireFormat::OpenAi);
        assert!("gemini".parse::<WireFormat>().is_err());
    }

    #[test]
    fn test_new_provider_is_healthy() {
        let p = provider();
        assert!(p.poll_and_maybe_recover());
        assert_eq!(p.health().backoff, Duration::ZERO);
    }

    #[test]
    fn test_mark_failed_doubles_and_caps() {
        let p = provider();
        let now = Instant::now();

        p.mark_failed_at(now);
        assert_eq!(p.health().backoff, INITIAL_BACKOFF);

        let mut previous = p.health().backoff;
        for _ in 0..5 {
            p.mark_failed_at(now);
            let backoff = p.health().backoff;
            assert_eq!(backoff, (previous * 2).min(MAX_BACKOFF));
            previous = backoff;
        }
        assert_eq!(previous, MAX_BACKOFF);
    }

    #[test]
    fn test_auth_failure_exceeds_transient_ceiling() {
        let p = provider();
        let now = Instant::now();

        p.mark_failed_at(now);
        p.mark_auth_failed_at(now);
        let health = p.health();
        assert!(health.auth_failed);
        assert_eq!(health.backoff, AUTH_INITIAL_BACKOFF);
        assert!(health.backoff >= MAX_BACKOFF);

        p.mark_auth_failed_at(now);
        assert_eq!(p.health().backoff, AUTH_INITIAL_BACKOFF * 2);

        for _ in 0..5 {
            p.mark_auth_failed_at(now);
        }
        assert_eq!(p.health().backoff, AUTH_MAX_BACKOFF);
    }

    #[test]
    fn test_recovers_only_after_backoff_elapsed() {
        let p = provider();
        let failed_at = Instant::now();
        p.mark_failed_at(failed_at);

        assert!(!p.poll_and_maybe_recover_at(failed_at));
        assert!(!p.poll_and_maybe_recover_at(
            failed_at + INITIAL_BACKOFF - Duration::from_millis(1)
        ));
        assert!(!p.health().healthy);

        assert!(p.poll_and_maybe_recover_at(failed_at + INITIAL_BACKOFF));
        assert!(p.health().healthy);
        // Recovery keeps the backoff so the next failure keeps escalating.
        assert_eq!(p.health().backoff, INITIAL_BACKOFF);
    }

    #[test]
    fn test_auth_failure_recovery_window() {
        let p = provider();
        let failed_at = Instant::now();
        p.mark_auth_failed_at(failed_at);

        assert!(!p.poll_and_maybe_recover_at(failed_at + MAX_BACKOFF));
        assert!(p.poll_and_maybe_recover_at(failed_at + AUTH_INITIAL_BACKOFF));
        assert!(p.health().auth_failed);
    }

    #[test]
    fn test_mark_healthy_resets_state() {
        let p = provider();
        p.mark_auth_failed();
        p.mark_healthy();

        let health = p.health();
        assert!(health.healthy);
        assert!(!health.auth_failed);
        assert_eq!(health.backoff, Duration::ZERO);

        p.mark_failed();
        assert_eq!(p.health().backoff, INITIAL_BACKOFF);
    }

    #[test]
    fn test_env_overlay_skips_empty_values() {
        let p = provider().with_env(
            "claude",
            [
                ("DISABLE_TELEMETRY".to_string(), "1".to_string()),
                ("EMPTY".to_string(), String::new()),
            ],
        );

        let overlay: Vec<_> = p.env_overlay("claude").collect();
        assert_eq!(overlay, vec![("DISABLE_TELEMETRY", "1")]);
        assert_eq!(p.env_overlay("codex").count(), 0);
    }

    #[test]
    fn test_from_config() {
        let config = ProviderConfig {
            name: "router".to_string(),
            format: "openai".to_string(),
            base_url: "https://openrouter.ai/api".to_string(),
            token: "sk-or".to_string(),
            models: ModelClassesConfig {
                default: Some("gpt-4.1".to_string()),
                ..Default::default()
            },
            env: HashMap::new(),
        };

        let p = Provider::from_config(&config).unwrap();
        assert_eq!(p.name(), "router");
        assert_eq!(p.format(), WireFormat::OpenAi);
        assert_eq!(p.token(), "sk-or");
        assert_eq!(p.models().default.as_deref(), Some("gpt-4.1"));
    }
}

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

pub const DEFAULT_PROFILE: &str = "default";
pub const DEFAULT_LONG_CONTEXT_THRESHOLD: usize = 32_000;

/// Main switchback configuration
///
/// Configuration is loaded from (in priority order):
/// 1. `switchback.jsonc` - JSON with comments
/// 2. `switchback.json` - Standard JSON
/// 3. `switchback.yml` / `switchback.yaml` - YAML format
///
/// Hidden variants (`.switchback.*`) and `~/.config/switchback/` are checked too.
///
/// # Example
///
/// ```yaml
/// providers:
///   - name: primary
///     base_url: https://api.anthropic.com
///     token: ${ANTHROPIC_API_KEY}
///   - name: backup
///     format: openai
///     base_url: https://openrouter.ai/api
///     token: ${OPENROUTER_API_KEY}
///     models:
///       default: anthropic/claude-sonnet-4
///       haiku: anthropic/claude-3.5-haiku
/// profiles:
///   default:
///     providers: [primary, backup]
///     routing:
///       think:
///         providers: [backup]
///         models:
///           backup: deepseek/deepseek-r1
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchbackConfig {
    /// Listener and client settings
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Log level and formatting
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Upstream providers, in declaration order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Named routing profiles
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,

    /// Profile used when none is selected on the command line
    #[serde(default = "default_active_profile")]
    pub active_profile: String,
}

impl SwitchbackConfig {
    pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profiles.get(name)
    }

    /// Check structural consistency: unique provider names, known formats,
    /// profile references that point at declared providers, and an active
    /// profile that exists.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                bail!("provider with empty name");
            }
            if !seen.insert(provider.name.as_str()) {
                bail!("duplicate provider name: {}", provider.name);
            }
            if provider.base_url.trim().is_empty() {
                bail!("provider {} has no base_url", provider.name);
            }
            match provider.format.trim().to_ascii_lowercase().as_str() {
                "" | "anthropic" | "openai" => {}
                other => bail!(
                    "provider {} has unknown format {:?} (expected anthropic or openai)",
                    provider.name,
                    other
                ),
            }
        }

        for (profile_name, profile) in &self.profiles {
            for name in profile.referenced_providers() {
                if !seen.contains(name) {
                    bail!(
                        "profile {} references unknown provider {}",
                        profile_name,
                        name
                    );
                }
            }
        }

        if self.profile(&self.active_profile).is_none() {
            bail!("active profile {} is not defined", self.active_profile);
        }

        Ok(())
    }
}

impl Default for SwitchbackConfig {
    fn default() -> Self {
        Self {
            proxy: ProxySettings::default(),
            logging: LoggingSettings::default(),
            providers: Vec::new(),
            profiles: BTreeMap::new(),
            active_profile: default_active_profile(),
        }
    }
}

fn default_active_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

// ============================================================================
// Proxy Settings
// ============================================================================

/// Listener and client settings
///
/// # Example
///
/// ```yaml
/// proxy:
///   host: 127.0.0.1
///   port: 0
///   client: codex
///   log_file: ~/.local/share/switchback/proxy.jsonl
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Bind host (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port, 0 picks an ephemeral port (default: 0)
    #[serde(default)]
    pub port: u16,

    /// Name of the calling CLI, selects provider env overlays (default: claude)
    #[serde(default = "default_client")]
    pub client: String,

    /// Wire format the calling CLI speaks. Derived from `client` when unset.
    #[serde(default)]
    pub client_format: Option<String>,

    /// Upstream request timeout in seconds (default: 600)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest inbound request body accepted (default: 64 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Append proxy decision records to this JSONL file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl ProxySettings {
    /// `codex` speaks OpenAI Chat Completions; every other client defaults to
    /// the Anthropic Messages format.
    pub fn effective_client_format(&self) -> &str {
        match self.client_format.as_deref() {
            Some(format) if !format.is_empty() => format,
            _ if self.client.eq_ignore_ascii_case("codex") => "openai",
            _ => "anthropic",
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            client: default_client(),
            client_format: None,
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
            log_file: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_client() -> String {
    "claude".to_string()
}

fn default_request_timeout() -> u64 {
    600
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

// ============================================================================
// Providers
// ============================================================================

/// One upstream backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    /// `anthropic` or `openai`; empty means anthropic
    #[serde(default)]
    pub format: String,

    pub base_url: String,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub models: ModelClassesConfig,

    /// Environment overlays keyed by calling CLI name
    #[serde(default)]
    pub env: HashMap<String, BTreeMap<String, String>>,
}

/// Model name per model class. Unset classes fall through to the next rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelClassesConfig {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub haiku: Option<String>,
    #[serde(default)]
    pub opus: Option<String>,
    #[serde(default)]
    pub sonnet: Option<String>,
}

// ============================================================================
// Profiles & Routing
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Default provider chain, tried in order
    #[serde(default)]
    pub providers: Vec<String>,

    /// Character count at which a request is routed as long-context
    #[serde(default)]
    pub long_context_threshold: Option<usize>,

    #[serde(default)]
    pub routing: RoutingConfig,
}

impl ProfileConfig {
    pub fn long_context_threshold(&self) -> usize {
        self.long_context_threshold
            .unwrap_or(DEFAULT_LONG_CONTEXT_THRESHOLD)
    }

    /// Every provider name this profile mentions, default chain first.
    pub fn referenced_providers(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(String::as_str).chain(
            self.routing
                .routes()
                .flat_map(|(_, route)| route.providers.iter().map(String::as_str)),
        )
    }
}

/// Per-scenario override chains
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub think: Option<ScenarioRouteConfig>,

    #[serde(default)]
    pub image: Option<ScenarioRouteConfig>,

    #[serde(default, rename = "longContext", alias = "long_context")]
    pub long_context: Option<ScenarioRouteConfig>,
}

impl RoutingConfig {
    /// Configured routes keyed by their wire name (`think`, `image`, `longContext`).
    pub fn routes(&self) -> impl Iterator<Item = (&'static str, &ScenarioRouteConfig)> {
        [
            ("think", self.think.as_ref()),
            ("image", self.image.as_ref()),
            ("longContext", self.long_context.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, route)| route.map(|r| (name, r)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioRouteConfig {
    #[serde(default)]
    pub providers: Vec<String>,

    /// Model overrides keyed by provider name
    #[serde(default)]
    pub models: HashMap<String, String>,
}

//! Configuration loading for switchback.
//!
//! Providers, profiles and per-scenario routing are read from a JSONC, JSON or
//! YAML file and validated before the proxy ever sees them. The proxy crate
//! consumes the resolved [`SwitchbackConfig`] and performs no file I/O itself.

pub mod loader;
pub mod schema;

pub use loader::{
    find_config_file, load_config_from_file, resolve_config, ConfigFormat, ResolvedConfig,
};
pub use schema::{
    LoggingSettings, ModelClassesConfig, ProfileConfig, ProviderConfig, ProxySettings,
    RoutingConfig, ScenarioRouteConfig, SwitchbackConfig, DEFAULT_LONG_CONTEXT_THRESHOLD,
    DEFAULT_PROFILE,
};
